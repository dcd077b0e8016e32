//! Peer records and mirrored collections behind the REST mirror.
//!
//! Entries are in memory and lost on restart, like the link registry.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use weektodo_proto::merge;
use weektodo_proto::rest::{PeerRecord, RegisterRequest};
use weektodo_proto::task::Task;

/// Errors from registry operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The named peer never registered.
    #[error("peer {0} not found")]
    UnknownPeer(String),
    /// A required identifier was empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

#[derive(Debug, Clone)]
struct Entry {
    record: PeerRecord,
    todos: Vec<Task>,
}

/// In-memory directory of registered peers.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Entry>>,
}

impl PeerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or refreshes a peer record. Device fields given in the request
    /// overwrite stored ones; the connected set is kept.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Empty`] for an empty peerId.
    pub async fn register(&self, req: RegisterRequest) -> Result<PeerRecord, RegistryError> {
        if req.peer_id.is_empty() {
            return Err(RegistryError::Empty("peerId"));
        }
        let mut peers = self.peers.write().await;
        let entry = peers.entry(req.peer_id.clone()).or_insert_with(|| Entry {
            record: PeerRecord {
                peer_id: req.peer_id.clone(),
                connected_peers: Vec::new(),
                last_sync: Utc::now(),
                device_name: None,
                device_type: None,
            },
            todos: Vec::new(),
        });
        if req.device_name.is_some() {
            entry.record.device_name = req.device_name;
        }
        if req.device_type.is_some() {
            entry.record.device_type = req.device_type;
        }
        Ok(entry.record.clone())
    }

    /// Adds `target` to the connected set of `source`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownPeer`] if either peer is not registered.
    pub async fn connect(&self, source: &str, target: &str) -> Result<(), RegistryError> {
        let mut peers = self.peers.write().await;
        if !peers.contains_key(target) {
            return Err(RegistryError::UnknownPeer(target.to_string()));
        }
        let entry = peers
            .get_mut(source)
            .ok_or_else(|| RegistryError::UnknownPeer(source.to_string()))?;
        if !entry.record.connected_peers.iter().any(|p| p == target) {
            entry.record.connected_peers.push(target.to_string());
        }
        Ok(())
    }

    /// Removes `from` from the connected set of `peer`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownPeer`] if `peer` is not registered.
    pub async fn disconnect(&self, peer: &str, from: &str) -> Result<(), RegistryError> {
        let mut peers = self.peers.write().await;
        let entry = peers
            .get_mut(peer)
            .ok_or_else(|| RegistryError::UnknownPeer(peer.to_string()))?;
        entry.record.connected_peers.retain(|p| p != from);
        Ok(())
    }

    /// Merges `incoming` into the peer's mirrored collection with
    /// last-write-wins and returns the merged collection.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownPeer`] if `peer` is not registered.
    pub async fn sync(
        &self,
        peer: &str,
        incoming: &[Task],
        at: DateTime<Utc>,
    ) -> Result<Vec<Task>, RegistryError> {
        let mut peers = self.peers.write().await;
        let entry = peers
            .get_mut(peer)
            .ok_or_else(|| RegistryError::UnknownPeer(peer.to_string()))?;
        let outcome = merge::resolve(&entry.todos, incoming);
        tracing::debug!(
            peer_id = %peer,
            replaced = outcome.replaced,
            inserted = outcome.inserted,
            skipped = outcome.skipped,
            "mirror merge"
        );
        entry.todos = outcome.tasks;
        entry.record.last_sync = at;
        Ok(entry.todos.clone())
    }

    /// Returns the record of `peer`.
    pub async fn get(&self, peer: &str) -> Option<PeerRecord> {
        self.peers.read().await.get(peer).map(|e| e.record.clone())
    }

    /// Number of registered peers.
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Whether no peer is registered.
    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}
