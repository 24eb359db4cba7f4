use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::connection::{ConnectionId, PeerHandle};

/// Process-local name of a connection.
///
/// `ip:port` of the remote end for inbound connections, caller-chosen for
/// outbound ones.
pub type PeerId = String;

/// Thread-safe map of peer id to connection handle.
///
/// Every read and write goes through one lock; callers that iterate take a
/// [`keys_snapshot`](Self::keys_snapshot) instead of holding the lock.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    peers: Arc<RwLock<HashMap<PeerId, Arc<PeerHandle>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `handle` under `peer_id`, returning the handle it displaced
    pub async fn put(&self, peer_id: PeerId, handle: Arc<PeerHandle>) -> Option<Arc<PeerHandle>> {
        self.peers.write().await.insert(peer_id, handle)
    }

    pub async fn get(&self, peer_id: &str) -> Option<Arc<PeerHandle>> {
        self.peers.read().await.get(peer_id).cloned()
    }

    pub async fn remove(&self, peer_id: &str) -> Option<Arc<PeerHandle>> {
        self.peers.write().await.remove(peer_id)
    }

    /// Remove `peer_id` only while it still maps to connection `id`.
    ///
    /// A worker uses this to drop its own entry without evicting a newer
    /// connection that took over the same peer id.
    pub async fn remove_if(&self, peer_id: &str, id: ConnectionId) -> Option<Arc<PeerHandle>> {
        let mut peers = self.peers.write().await;
        match peers.get(peer_id) {
            Some(handle) if handle.id() == id => peers.remove(peer_id),
            _ => None,
        }
    }

    /// Point-in-time copy of the registered peer ids
    pub async fn keys_snapshot(&self) -> Vec<PeerId> {
        self.peers.read().await.keys().cloned().collect()
    }

    pub async fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Empty the registry and hand back everything that was in it
    pub async fn drain(&self) -> Vec<(PeerId, Arc<PeerHandle>)> {
        self.peers.write().await.drain().collect()
    }
}
