//! Durable local peer identity.
//!
//! The peerId is generated once (a UUID v7) and saved with the set of peers
//! this device wants to stay connected to, the time of the last completed
//! sync, and optional device metadata. The file is JSON:
//!
//! ```json
//! { "peerId": "...", "connectedPeers": ["..."], "lastSync": "...",
//!   "deviceName": "laptop", "deviceType": "desktop" }
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::PeerError;
use crate::transport::PeerId;

/// Default file name inside the data directory.
pub const IDENTITY_FILE: &str = "peer.json";

/// Persisted peer state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerState {
    pub peer_id: String,
    #[serde(default)]
    pub connected_peers: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
}

impl PeerState {
    fn fresh(peer_id: Option<String>, device_name: Option<String>, device_type: Option<String>) -> Self {
        Self {
            peer_id: peer_id.unwrap_or_else(|| uuid::Uuid::now_v7().to_string()),
            connected_peers: BTreeSet::new(),
            last_sync: None,
            device_name,
            device_type,
        }
    }
}

/// Values from configuration that seed or override the stored identity.
#[derive(Debug, Clone, Default)]
pub struct DeviceProfile {
    /// Forces this peerId instead of the stored or generated one.
    pub peer_id: Option<String>,
    /// Human-readable device name.
    pub device_name: Option<String>,
    /// Device class, e.g. `desktop` or `phone`.
    pub device_type: Option<String>,
}

/// The local peer's identity, shared by the manager, the handler, and the
/// engine.
#[derive(Debug)]
pub struct Identity {
    path: Option<PathBuf>,
    state: Mutex<PeerState>,
    persisted: AtomicBool,
    write_lock: tokio::sync::Mutex<()>,
}

impl Identity {
    /// Loads the identity stored at `path`, or creates a new one there.
    ///
    /// Nothing is written until [`Identity::persist`] is called.
    ///
    /// # Errors
    ///
    /// [`PeerError::Identity`] if the file exists but cannot be read or parsed.
    pub async fn load_or_create(path: impl Into<PathBuf>, profile: DeviceProfile) -> Result<Self, PeerError> {
        let path = path.into();
        let (state, persisted) = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let mut state: PeerState = serde_json::from_str(&raw)
                    .map_err(|e| PeerError::Identity(format!("{}: {e}", path.display())))?;
                if let Some(id) = profile.peer_id {
                    state.peer_id = id;
                }
                if profile.device_name.is_some() {
                    state.device_name = profile.device_name;
                }
                if profile.device_type.is_some() {
                    state.device_type = profile.device_type;
                }
                (state, true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (
                PeerState::fresh(profile.peer_id, profile.device_name, profile.device_type),
                false,
            ),
            Err(e) => return Err(PeerError::Identity(format!("{}: {e}", path.display()))),
        };
        tracing::info!(peer_id = %state.peer_id, path = %path.display(), "peer identity ready");
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
            persisted: AtomicBool::new(persisted),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// An identity that is never written to disk.
    pub fn ephemeral(peer_id: impl Into<String>) -> Self {
        Self {
            path: None,
            state: Mutex::new(PeerState::fresh(Some(peer_id.into()), None, None)),
            persisted: AtomicBool::new(true),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Where the identity is stored, if anywhere.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// This peer's id.
    pub fn peer_id(&self) -> PeerId {
        PeerId::new(self.state.lock().peer_id.clone())
    }

    /// A copy of the full state.
    pub fn state(&self) -> PeerState {
        self.state.lock().clone()
    }

    /// Peers this device wants to stay connected to.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.state
            .lock()
            .connected_peers
            .iter()
            .map(|p| PeerId::new(p.as_str()))
            .collect()
    }

    /// Whether `peer` is in the connected set.
    pub fn is_remembered(&self, peer: &PeerId) -> bool {
        self.state.lock().connected_peers.contains(peer.as_str())
    }

    /// Adds `peer` to the connected set. Returns `false` if already present.
    pub fn remember(&self, peer: &PeerId) -> bool {
        self.state.lock().connected_peers.insert(peer.as_str().to_string())
    }

    /// Removes `peer` from the connected set. Returns `false` if absent.
    pub fn forget(&self, peer: &PeerId) -> bool {
        self.state.lock().connected_peers.remove(peer.as_str())
    }

    /// Time of the last completed sync.
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_sync
    }

    /// Records a completed sync.
    pub fn mark_synced(&self, at: DateTime<Utc>) {
        self.state.lock().last_sync = Some(at);
    }

    /// Writes the state to disk if this identity has a path.
    ///
    /// # Errors
    ///
    /// [`PeerError::Identity`] if the file cannot be written.
    pub async fn persist(&self) -> Result<(), PeerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let raw = serde_json::to_string_pretty(&self.state())
            .map_err(|e| PeerError::Identity(e.to_string()))?;
        let io_err = |e: std::io::Error| PeerError::Identity(format!("{}: {e}", path.display()));
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        self.persisted.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Writes the identity once if it has never been saved.
    ///
    /// # Errors
    ///
    /// Same as [`Identity::persist`].
    pub async fn ensure_persisted(&self) -> Result<(), PeerError> {
        if self.persisted.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.persist().await
    }
}
