//! Connection registry: which identities are connected, and through which
//! connections.
//!
//! An identity may hold several connections at once (one per browser tab).
//! It is online exactly while at least one of them is registered. Both
//! indexes live behind a single lock so every mutation updates them together
//! and every read sees them agree.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use huddle_proto::event::ServerEvent;
use huddle_proto::identity::Identity;
use tokio::sync::{Notify, RwLock, mpsc};
use uuid::Uuid;

/// Capacity of each connection's outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Process-local identifier of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Creates a new time-ordered connection identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Items queued for a connection's WebSocket writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// An event to encode and send.
    Event(Arc<ServerEvent>),
    /// Send a close frame and stop writing.
    Close,
}

/// Why an outbound push failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    /// The queue was full; the event was dropped and the connection is
    /// being closed.
    #[error("outbound queue full")]
    Full,
    /// The connection's writer is gone.
    #[error("connection closed")]
    Closed,
}

/// Creates a bounded outbound queue for one connection.
#[must_use]
pub fn outbound_queue(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    let (queue, rx) = mpsc::channel(capacity);
    let overflow = Arc::new(Notify::new());
    (
        OutboundSender {
            queue,
            overflow: Arc::clone(&overflow),
        },
        OutboundReceiver { queue: rx, overflow },
    )
}

/// Sending half of a connection's outbound queue.
///
/// Pushes never wait. A push that finds the queue full drops the item and
/// flags the connection, whose writer then stops and closes the socket.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    queue: mpsc::Sender<Outbound>,
    overflow: Arc<Notify>,
}

impl OutboundSender {
    /// Queues `item` for the writer.
    ///
    /// # Errors
    ///
    /// [`PushError::Full`] if the client is not keeping up (the connection
    /// is then closed), [`PushError::Closed`] if the writer has stopped.
    pub fn push(&self, item: Outbound) -> Result<(), PushError> {
        match self.queue.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.overflow.notify_one();
                Err(PushError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }

    /// Asks the writer to send a close frame after what is already queued,
    /// or right away if the queue is full.
    pub fn close(&self) {
        let _ = self.push(Outbound::Close);
    }
}

/// Receiving half of a connection's outbound queue, owned by its writer.
#[derive(Debug)]
pub struct OutboundReceiver {
    queue: mpsc::Receiver<Outbound>,
    overflow: Arc<Notify>,
}

impl OutboundReceiver {
    /// Next item for the writer.
    ///
    /// Yields [`Outbound::Close`] as soon as the queue has overflowed, and
    /// `None` once every sender is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<Outbound> {
        tokio::select! {
            biased;
            () = self.overflow.notified() => Some(Outbound::Close),
            item = self.queue.recv() => item,
        }
    }

    /// Takes a queued item without waiting.
    ///
    /// # Errors
    ///
    /// [`mpsc::error::TryRecvError`] if nothing is queued.
    pub fn try_recv(&mut self) -> Result<Outbound, mpsc::error::TryRecvError> {
        self.queue.try_recv()
    }
}

/// Result of [`ConnectionRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// Handle of the new connection.
    pub handle: ConnectionId,
    /// Whether this is the identity's only connection (0 → 1 transition).
    pub first: bool,
}

/// Result of [`ConnectionRegistry::unregister`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// Identity the removed connection was bound to.
    pub identity: Identity,
    /// Connections still open for that identity.
    pub remaining: usize,
}

/// A registered connection's routing information.
#[derive(Debug, Clone)]
pub struct Route {
    /// Identity bound to the connection.
    pub identity: Identity,
    /// Outbound queue of the connection.
    pub sender: OutboundSender,
}

struct Connection {
    identity: Identity,
    sender: OutboundSender,
}

#[derive(Default)]
struct Inner {
    by_handle: HashMap<ConnectionId, Connection>,
    by_identity: HashMap<Identity, HashSet<ConnectionId>>,
}

/// Registry of open connections, indexed by handle and by identity.
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Binds a new connection to `identity`.
    pub async fn register(&self, identity: Identity, sender: OutboundSender) -> Registration {
        let handle = ConnectionId::new();
        let mut inner = self.inner.write().await;
        let handles = inner.by_identity.entry(identity.clone()).or_default();
        handles.insert(handle);
        let first = handles.len() == 1;
        inner
            .by_handle
            .insert(handle, Connection { identity, sender });
        drop(inner);

        Registration { handle, first }
    }

    /// Removes a connection.
    ///
    /// Returns `None` if the handle is not registered, which happens when a
    /// transport close races an explicit disconnect.
    pub async fn unregister(&self, handle: ConnectionId) -> Option<Departure> {
        let mut inner = self.inner.write().await;
        let connection = inner.by_handle.remove(&handle)?;
        let remaining = match inner.by_identity.get_mut(&connection.identity) {
            Some(handles) => {
                handles.remove(&handle);
                handles.len()
            }
            None => 0,
        };
        if remaining == 0 {
            inner.by_identity.remove(&connection.identity);
        }
        drop(inner);

        Some(Departure {
            identity: connection.identity,
            remaining,
        })
    }

    /// Returns the open connections of `identity`; empty means offline.
    pub async fn connections_for(&self, identity: &Identity) -> Vec<ConnectionId> {
        let inner = self.inner.read().await;
        inner
            .by_identity
            .get(identity)
            .map(|handles| handles.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether `identity` has at least one open connection.
    pub async fn is_online(&self, identity: &Identity) -> bool {
        let inner = self.inner.read().await;
        inner.by_identity.contains_key(identity)
    }

    /// Returns the identity bound to `handle`, if registered.
    pub async fn identity_of(&self, handle: ConnectionId) -> Option<Identity> {
        let inner = self.inner.read().await;
        inner.by_handle.get(&handle).map(|c| c.identity.clone())
    }

    /// Resolves several handles under one read lock.
    ///
    /// Each handle is paired with its route, or `None` if it is not
    /// registered.
    pub async fn routes(&self, handles: &[ConnectionId]) -> Vec<(ConnectionId, Option<Route>)> {
        let inner = self.inner.read().await;
        handles
            .iter()
            .map(|handle| {
                let route = inner.by_handle.get(handle).map(|c| Route {
                    identity: c.identity.clone(),
                    sender: c.sender.clone(),
                });
                (*handle, route)
            })
            .collect()
    }

    /// Identities with at least one open connection.
    pub async fn online_identities(&self) -> Vec<Identity> {
        let inner = self.inner.read().await;
        inner.by_identity.keys().cloned().collect()
    }

    /// Total number of open connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.by_handle.len()
    }

    /// Asks every connection's writer to send a close frame.
    ///
    /// Connections stay registered until their handler tears them down.
    pub async fn close_all(&self) {
        let inner = self.inner.read().await;
        for (handle, connection) in &inner.by_handle {
            tracing::info!(
                connection = %handle,
                identity = %connection.identity,
                "sending close frame"
            );
            connection.sender.close();
        }
    }
}
