//! Ordered fan-out of server messages to every connection.
//!
//! All connections share one tokio broadcast channel, so every connection
//! observes envelopes in the exact order they were sent. Each envelope
//! carries a [`Target`]; a connection forwards only the envelopes meant
//! for it. Payloads are encoded once and shared.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use tilelog_core::UserId;

use crate::protocol::{ProtocolError, ServerMessage};

/// Server-local connection handle.
pub type ConnectionId = u64;

/// Which connections an envelope is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    All,
    Only(ConnectionId),
    AllExcept(ConnectionId),
}

impl Target {
    pub fn includes(&self, conn: ConnectionId) -> bool {
        match *self {
            Target::All => true,
            Target::Only(id) => id == conn,
            Target::AllExcept(id) => id != conn,
        }
    }
}

/// A pre-encoded JSON text frame plus its addressing.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub target: Target,
    pub payload: Arc<String>,
}

impl Envelope {
    pub fn is_for(&self, conn: ConnectionId) -> bool {
        self.target.includes(conn)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// The broadcast group of the shared document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,

    /// Connected peers and the user id each was assigned
    peers: Arc<RwLock<HashMap<ConnectionId, UserId>>>,

    /// Messages buffered per receiver before it lags
    capacity: usize,

    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a group buffering up to `capacity` envelopes per receiver.
    ///
    /// A receiver that falls further behind than that lags and has to be
    /// resynchronized from scratch.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Register a connection and return its receiver.
    ///
    /// The receiver sees every envelope sent after this call returns.
    pub async fn add_peer(
        &self,
        conn: ConnectionId,
        user_id: UserId,
    ) -> broadcast::Receiver<Arc<Envelope>> {
        let mut peers = self.peers.write().await;
        peers.insert(conn, user_id);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, conn: ConnectionId) -> Option<UserId> {
        let mut peers = self.peers.write().await;
        peers.remove(&conn)
    }

    /// Encode `msg` once and send it to `target`.
    ///
    /// Returns the number of live receivers, addressed or not.
    pub fn send(&self, target: Target, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        let payload = Arc::new(msg.encode()?);
        Ok(self.send_raw(Arc::new(Envelope { target, payload })))
    }

    pub fn send_raw(&self, envelope: Arc<Envelope>) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for envelopes a lagging receiver never saw.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// User ids of all connected peers.
    pub async fn peers(&self) -> Vec<UserId> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, conn: ConnectionId) -> bool {
        self.peers.read().await.contains_key(&conn)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
