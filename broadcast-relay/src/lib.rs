//! WebSocket broadcast relay: every message a client sends is relayed to
//! every connected client.
//!
//! - [`connection`] wraps one duplex message transport so concurrent writers
//!   never interleave and close is idempotent.
//! - [`hub`] owns the set of live connections. A single event loop applies
//!   registrations, unregistrations and broadcasts in one total order and
//!   fans each message out without waiting on slow peers.
//! - [`transport`] adapts an axum WebSocket, or an in-memory loopback, into a
//!   [`connection::Connection`].
//! - [`server`] hosts the hub behind an HTTP listener with a `/ws` endpoint.
//! - [`client`] is a terminal client for the relay.
//! - [`cli`] parses the `start` and `connect` subcommands.
//!
//! The hub can be embedded without the HTTP layers:
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use broadcast_relay::{
//!     hub::{Hub, HubConfig, read_loop},
//!     transport,
//! };
//!
//! # async fn demo() -> Result<(), broadcast_relay::hub::HubError> {
//! let (hub, _event_loop) = Hub::spawn(HubConfig::default());
//!
//! let (connection, mut peer) = transport::loopback();
//! let connection = Arc::new(connection);
//! hub.register(Arc::clone(&connection))?;
//! tokio::spawn(read_loop(hub.clone(), connection));
//!
//! hub.submit("hello").await?;
//! assert_eq!(peer.recv().await.as_deref(), Some(&b"hello"[..]));
//!
//! hub.shutdown(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod client;
pub mod connection;
pub mod hub;
pub mod server;
pub mod transport;
