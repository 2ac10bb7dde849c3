//! The connection hub.
//!
//! The hub tracks every live [`Connection`] and relays each submitted message
//! to all of them. It is split in two halves:
//!
//! - [`HubHandle`]: a cheap, cloneable front end. `register`, `unregister`
//!   and `submit` only enqueue work; `shutdown` coordinates teardown.
//! - [`Hub`]: the event loop. It is the only task that mutates membership,
//!   so registrations, unregistrations and broadcasts are totally ordered in
//!   the order the loop consumes them.
//!
//! # Fan-out
//!
//! Every member owns a bounded outbound queue drained by a single writer
//! task, so each connection sees messages in the order the loop broadcast
//! them. The loop only ever `try_send`s into those queues and never waits
//! on a write: a member whose queue is full is pruned on the spot. A writer
//! whose write fails sends the connection back through the unregistration
//! queue, which is unbounded so a writer can never block on a busy loop.
//!
//! # Backpressure
//!
//! The inbound queue is bounded by [`HubConfig::queue_capacity`]. When it is
//! full, [`HubHandle::submit`] waits for space instead of dropping messages.
//! Once shutdown begins, `submit` fails fast with [`HubError::ShuttingDown`],
//! including callers that were already waiting.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    select,
    sync::{
        RwLock,
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::{JoinHandle, JoinSet},
    time::{Instant, timeout, timeout_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionError, ConnectionId};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Messages that may wait in the inbound queue before `submit` blocks.
    pub queue_capacity: usize,
    /// Messages that may wait for one member's writer. A member that falls
    /// this far behind is pruned.
    pub outbound_capacity: usize,
    /// Writes slower than this count as failures and prune the connection.
    /// `None` lets a write wait on the transport indefinitely.
    pub write_timeout: Option<Duration>,
    /// Upper bound on closing a connection outside of shutdown.
    pub close_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("hub is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub members: usize,
    pub broadcasts: u64,
    pub deliveries: u64,
    pub write_failures: u64,
}

/// Outcome of [`HubHandle::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections whose close finished before the deadline.
    pub closed: usize,
    /// Connections still closing at the deadline; their close keeps running
    /// in the background.
    pub abandoned: usize,
}

#[derive(Default)]
struct Counters {
    broadcasts: AtomicU64,
    deliveries: AtomicU64,
    write_failures: AtomicU64,
}

struct Member {
    connection: Arc<Connection>,
    outbound: mpsc::Sender<Bytes>,
}

struct Shared {
    members: RwLock<HashMap<ConnectionId, Member>>,
    counters: Counters,
    close_timeout: Duration,
    closing: CancellationToken,
    stopped: CancellationToken,
}

struct ShutdownRequest {
    respond_to: oneshot::Sender<Vec<Arc<Connection>>>,
}

#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::UnboundedSender<Arc<Connection>>,
    unregister_tx: mpsc::UnboundedSender<Arc<Connection>>,
    inbound_tx: mpsc::Sender<Bytes>,
    shutdown_tx: mpsc::Sender<ShutdownRequest>,
    shared: Arc<Shared>,
}

impl HubHandle {
    /// Makes `connection` broadcast-eligible.
    ///
    /// Fails only once shutdown has begun, in which case the connection is
    /// closed instead of registered.
    pub fn register(&self, connection: Arc<Connection>) -> Result<(), HubError> {
        if self.is_shutting_down() {
            refuse(connection, self.shared.close_timeout);
            return Err(HubError::ShuttingDown);
        }

        if let Err(mpsc::error::SendError(connection)) = self.register_tx.send(connection) {
            refuse(connection, self.shared.close_timeout);
            return Err(HubError::ShuttingDown);
        }
        Ok(())
    }

    /// Removes `connection` from membership and closes it. Calling this more
    /// than once, or for a connection that was never registered, is harmless.
    pub fn unregister(&self, connection: Arc<Connection>) {
        if let Err(mpsc::error::SendError(connection)) = self.unregister_tx.send(connection) {
            // The event loop is gone; nothing left to remove it from.
            spawn_close(connection, self.shared.close_timeout);
        }
    }

    /// Queues `message` for broadcast, waiting while the queue is full.
    pub async fn submit(&self, message: impl Into<Bytes>) -> Result<(), HubError> {
        if self.is_shutting_down() {
            return Err(HubError::ShuttingDown);
        }

        let message = message.into();
        select! {
            biased;
            _ = self.shared.closing.cancelled() => Err(HubError::ShuttingDown),
            sent = self.inbound_tx.send(message) => sent.map_err(|_| HubError::ShuttingDown),
        }
    }

    /// Closes every member and stops the event loop, returning no later than
    /// `deadline` after the call.
    ///
    /// Registrations and submissions fail from the moment this is called.
    /// Messages still queued are dropped. A second call waits for the first
    /// to finish (bounded by its own deadline) and reports nothing.
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        let deadline = Instant::now() + deadline;
        self.shared.closing.cancel();

        let (respond_to, response) = oneshot::channel();
        if self.shutdown_tx.try_send(ShutdownRequest { respond_to }).is_ok() {
            match timeout_at(deadline, response).await {
                Ok(Ok(retiring)) => return close_all(retiring, deadline).await,
                Ok(Err(_)) => debug!("hub event loop dropped the shutdown request"),
                Err(_) => {
                    warn!("hub event loop did not answer the shutdown request in time");
                    return ShutdownReport::default();
                }
            }
        }

        if timeout_at(deadline, self.shared.stopped.cancelled())
            .await
            .is_err()
        {
            warn!("hub event loop still running at the shutdown deadline");
        }
        ShutdownReport::default()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.closing.is_cancelled()
    }

    /// Resolves once shutdown has begun.
    pub async fn shutting_down(&self) {
        self.shared.closing.cancelled().await;
    }

    /// Resolves once the event loop has exited.
    pub async fn stopped(&self) {
        self.shared.stopped.cancelled().await;
    }

    /// Current members, sorted by id.
    pub async fn members(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.shared.members.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn stats(&self) -> HubStats {
        let counters = &self.shared.counters;
        HubStats {
            members: self.shared.members.read().await.len(),
            broadcasts: counters.broadcasts.load(Ordering::Relaxed),
            deliveries: counters.deliveries.load(Ordering::Relaxed),
            write_failures: counters.write_failures.load(Ordering::Relaxed),
        }
    }
}

/// The hub event loop. Build it with [`Hub::new`] and drive it with
/// [`Hub::run`], usually on its own task.
pub struct Hub {
    config: HubConfig,
    register_rx: mpsc::UnboundedReceiver<Arc<Connection>>,
    unregister_rx: mpsc::UnboundedReceiver<Arc<Connection>>,
    inbound_rx: mpsc::Receiver<Bytes>,
    shutdown_rx: mpsc::Receiver<ShutdownRequest>,
    unregister_tx: mpsc::UnboundedSender<Arc<Connection>>,
    shared: Arc<Shared>,
}

impl Hub {
    pub fn new(config: HubConfig) -> (HubHandle, Hub) {
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            members: RwLock::new(HashMap::new()),
            counters: Counters::default(),
            close_timeout: config.close_timeout,
            closing: CancellationToken::new(),
            stopped: CancellationToken::new(),
        });

        let handle = HubHandle {
            register_tx,
            unregister_tx: unregister_tx.clone(),
            inbound_tx,
            shutdown_tx,
            shared: Arc::clone(&shared),
        };
        let hub = Hub {
            config,
            register_rx,
            unregister_rx,
            inbound_rx,
            shutdown_rx,
            unregister_tx,
            shared,
        };
        (handle, hub)
    }

    /// Builds a hub and spawns its event loop on the current runtime.
    pub fn spawn(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (handle, hub) = Self::new(config);
        (handle, tokio::spawn(hub.run()))
    }

    /// Runs until shutdown is requested or every [`HubHandle`] is dropped.
    ///
    /// Each iteration handles exactly one event. Sources are polled in a fixed
    /// priority: shutdown, registration, unregistration, inbound messages.
    pub async fn run(mut self) {
        info!(
            queue_capacity = self.config.queue_capacity,
            "hub event loop started"
        );

        loop {
            select! {
                biased;
                Some(request) = self.shutdown_rx.recv() => {
                    self.handle_shutdown(request).await;
                    break;
                }
                Some(connection) = self.register_rx.recv() => {
                    self.add_member(connection).await;
                }
                Some(connection) = self.unregister_rx.recv() => {
                    self.remove_member(connection).await;
                }
                message = self.inbound_rx.recv() => match message {
                    Some(message) => {
                        self.apply_pending_membership().await;
                        self.broadcast(message).await;
                    }
                    None => {
                        self.release_members().await;
                        break;
                    }
                },
            }
        }

        self.shared.stopped.cancel();
        info!("hub event loop stopped");
    }

    async fn add_member(&self, connection: Arc<Connection>) {
        let id = connection.id();
        if connection.is_closed() {
            debug!(connection = %id, "ignoring registration of a closed connection");
            return;
        }

        let mut members = self.shared.members.write().await;
        if members.contains_key(&id) {
            return;
        }

        let (outbound, queue) = mpsc::channel(self.config.outbound_capacity.max(1));
        tokio::spawn(write_loop(
            Arc::clone(&connection),
            queue,
            self.config.write_timeout,
            self.unregister_tx.clone(),
            Arc::clone(&self.shared),
        ));
        members.insert(id, Member { connection, outbound });
        debug!(connection = %id, members = members.len(), "connection registered");
    }

    async fn remove_member(&self, connection: Arc<Connection>) {
        let id = connection.id();
        let removed = {
            let mut members = self.shared.members.write().await;
            members.remove(&id).map(|_| members.len())
        };
        if let Some(remaining) = removed {
            debug!(connection = %id, members = remaining, "connection unregistered");
        }

        // Failing IO right away keeps a stale registration from re-adding it.
        connection.mark_closed();
        spawn_close(connection, self.shared.close_timeout);
    }

    /// Applies membership changes that were enqueued before the message the
    /// loop just dequeued, so program order between a `register` or
    /// `unregister` and a later `submit` is preserved.
    async fn apply_pending_membership(&mut self) {
        while let Ok(connection) = self.register_rx.try_recv() {
            self.add_member(connection).await;
        }
        while let Ok(connection) = self.unregister_rx.try_recv() {
            self.remove_member(connection).await;
        }
    }

    async fn broadcast(&self, message: Bytes) {
        let mut lagging = Vec::new();
        {
            let members = self.shared.members.read().await;
            self.shared
                .counters
                .broadcasts
                .fetch_add(1, Ordering::Relaxed);
            debug!(targets = members.len(), bytes = message.len(), "broadcasting message");

            for member in members.values() {
                match member.outbound.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => lagging.push(Arc::clone(&member.connection)),
                    // The writer already failed and asked for removal.
                    Err(TrySendError::Closed(_)) => {}
                }
            }
        }

        for connection in lagging {
            self.shared
                .counters
                .write_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!(connection = %connection.id(), "outbound queue full, unregistering connection");
            self.remove_member(connection).await;
        }
    }

    /// Hands every member, plus anything still waiting in the membership
    /// queues, back to the caller of `shutdown`, which closes them.
    async fn handle_shutdown(&mut self, request: ShutdownRequest) {
        self.register_rx.close();
        self.unregister_rx.close();

        let mut retiring: HashMap<ConnectionId, Arc<Connection>> = self
            .shared
            .members
            .write()
            .await
            .drain()
            .map(|(id, member)| (id, member.connection))
            .collect();
        while let Ok(connection) = self.register_rx.try_recv() {
            retiring.insert(connection.id(), connection);
        }
        while let Ok(connection) = self.unregister_rx.try_recv() {
            retiring.insert(connection.id(), connection);
        }

        let dropped = self.inbound_rx.len();
        if dropped > 0 {
            info!(dropped, "discarding undelivered messages at shutdown");
        }
        info!(connections = retiring.len(), "hub shutting down");

        let retiring: Vec<_> = retiring.into_values().collect();
        for connection in &retiring {
            connection.mark_closed();
        }
        if let Err(retiring) = request.respond_to.send(retiring) {
            for connection in retiring {
                spawn_close(connection, self.shared.close_timeout);
            }
        }
    }

    async fn release_members(&mut self) {
        info!("all hub handles dropped, releasing members");
        let members: Vec<_> = self
            .shared
            .members
            .write()
            .await
            .drain()
            .map(|(_, member)| member.connection)
            .collect();
        for connection in members {
            spawn_close(connection, self.shared.close_timeout);
        }
    }
}

/// Reads from `connection` and submits every message to the hub until the
/// connection ends, the hub shuts down, or a submit fails. Unregisters the
/// connection on the way out.
pub async fn read_loop(hub: HubHandle, connection: Arc<Connection>) {
    let id = connection.id();

    loop {
        let read = select! {
            biased;
            _ = hub.shutting_down() => break,
            read = connection.read() => read,
        };

        match read {
            Ok(message) => {
                if let Err(error) = hub.submit(message).await {
                    debug!(connection = %id, %error, "stopping read loop");
                    break;
                }
            }
            Err(ConnectionError::Closed) => {
                debug!(connection = %id, "connection closed");
                break;
            }
            Err(error) => {
                warn!(connection = %id, %error, "read failed");
                break;
            }
        }
    }

    hub.unregister(connection);
}

/// Drains one member's outbound queue in order. Stops when the queue is
/// dropped or a write fails; a failure asks the loop to unregister the
/// connection.
async fn write_loop(
    connection: Arc<Connection>,
    mut queue: mpsc::Receiver<Bytes>,
    write_timeout: Option<Duration>,
    unregister_tx: mpsc::UnboundedSender<Arc<Connection>>,
    shared: Arc<Shared>,
) {
    let error = loop {
        let Some(message) = queue.recv().await else {
            return;
        };
        match deliver(&connection, message, write_timeout).await {
            Ok(()) => {
                shared.counters.deliveries.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => break error,
        }
    };

    if error == ConnectionError::Closed {
        debug!(connection = %connection.id(), "connection closed, stopping writer");
    } else {
        shared
            .counters
            .write_failures
            .fetch_add(1, Ordering::Relaxed);
        warn!(connection = %connection.id(), %error, "write failed, unregistering connection");
    }

    if let Err(mpsc::error::SendError(connection)) = unregister_tx.send(connection) {
        debug!(connection = %connection.id(), "hub stopped, leaving the connection to shutdown");
    }
}

async fn deliver(
    connection: &Connection,
    message: Bytes,
    write_timeout: Option<Duration>,
) -> Result<(), ConnectionError> {
    match write_timeout {
        Some(limit) => timeout(limit, connection.write(message))
            .await
            .unwrap_or(Err(ConnectionError::TimedOut)),
        None => connection.write(message).await,
    }
}

/// Closes every connection concurrently. Closes still running at `deadline`
/// are detached and reported as abandoned.
async fn close_all(connections: Vec<Arc<Connection>>, deadline: Instant) -> ShutdownReport {
    let mut pending = JoinSet::new();
    for connection in connections {
        pending.spawn(async move {
            if let Err(error) = connection.close().await {
                debug!(connection = %connection.id(), %error, "close failed during shutdown");
            }
        });
    }

    let mut report = ShutdownReport::default();
    loop {
        match timeout_at(deadline, pending.join_next()).await {
            Ok(Some(_)) => report.closed += 1,
            Ok(None) => break,
            Err(_) => {
                report.abandoned = pending.len();
                warn!(
                    abandoned = report.abandoned,
                    "shutdown deadline reached with connections still closing"
                );
                pending.detach_all();
                break;
            }
        }
    }
    report
}

fn refuse(connection: Arc<Connection>, close_timeout: Duration) {
    debug!(connection = %connection.id(), "hub is shutting down, refusing registration");
    connection.mark_closed();
    spawn_close(connection, close_timeout);
}

fn spawn_close(connection: Arc<Connection>, limit: Duration) {
    tokio::spawn(close_within(connection, limit));
}

/// Closes `connection`, giving up once `limit` has passed.
async fn close_within(connection: Arc<Connection>, limit: Duration) {
    match timeout(limit, connection.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => debug!(connection = %connection.id(), %error, "close failed"),
        Err(_) => warn!(connection = %connection.id(), "close did not finish in time, abandoning it"),
    }
}
