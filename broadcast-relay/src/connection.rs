//! A synchronized wrapper around one duplex message transport.
//!
//! The transport is split into a read half ([`MessageStream`]) and a write
//! half ([`MessageSink`]). Writes are serialized through an async mutex so
//! any number of tasks may call [`Connection::write`] at once without two
//! messages interleaving on the wire. Reads are expected to come from a
//! single task; they take their own lock so they never wait on a writer.

use std::{
    fmt,
    pin::Pin,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::{select, sync::Mutex};
use tokio_util::sync::CancellationToken;

pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Bytes, ConnectionError>> + Send>>;
pub type MessageSink = Pin<Box<dyn Sink<Bytes, Error = ConnectionError> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The connection was closed locally or the peer ended the stream.
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("write timed out")]
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

pub struct Connection {
    id: ConnectionId,
    reader: Mutex<MessageStream>,
    writer: Mutex<MessageSink>,
    closed: CancellationToken,
    sink_closed: AtomicBool,
}

impl Connection {
    pub fn new<S, K>(stream: S, sink: K) -> Self
    where
        S: Stream<Item = Result<Bytes, ConnectionError>> + Send + 'static,
        K: Sink<Bytes, Error = ConnectionError> + Send + 'static,
    {
        Self {
            id: ConnectionId::next(),
            reader: Mutex::new(Box::pin(stream)),
            writer: Mutex::new(Box::pin(sink)),
            closed: CancellationToken::new(),
            sink_closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Waits for the next complete message.
    ///
    /// End of stream and a local [`close`](Self::close) both surface as
    /// [`ConnectionError::Closed`].
    pub async fn read(&self) -> Result<Bytes, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let mut reader = self.reader.lock().await;
        select! {
            biased;
            _ = self.closed.cancelled() => Err(ConnectionError::Closed),
            next = reader.next() => next.unwrap_or(Err(ConnectionError::Closed)),
        }
    }

    /// Sends one whole message while holding the write lock.
    ///
    /// A write parked on a stalled transport is aborted with
    /// [`ConnectionError::Closed`] as soon as the connection is closed, which
    /// also releases the lock for the closer.
    pub async fn write(&self, message: Bytes) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let mut writer = self.writer.lock().await;
        select! {
            biased;
            _ = self.closed.cancelled() => Err(ConnectionError::Closed),
            result = writer.send(message) => result,
        }
    }

    /// Closes the transport. Only the first call touches the sink; later
    /// calls return `Ok(())` immediately.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        self.mark_closed();
        if self.sink_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut writer = self.writer.lock().await;
        match writer.close().await {
            Ok(()) | Err(ConnectionError::Closed) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Fails pending and future reads and writes without touching the sink.
    pub(crate) fn mark_closed(&self) {
        self.closed.cancel();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
