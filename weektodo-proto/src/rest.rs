//! Request and response bodies of the REST mirror.
//!
//! The mirror lets devices without a direct peer link register, record which
//! peers they talk to, and push their collection through the same
//! last-write-wins contract peers use among themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::Task;

/// `POST /peer/register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
}

/// `POST /peer/connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub source_peer_id: String,
    pub target_peer_id: String,
}

/// `POST /peer/sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub peer_id: String,
    pub timestamp: DateTime<Utc>,
    pub todos: Vec<Task>,
}

/// `POST /peer/disconnect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequest {
    pub peer_id: String,
    pub disconnect_from_peer_id: String,
}

/// Successful reply. `todos` is present on `/peer/sync` only and holds the
/// merged collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todos: Option<Vec<Task>>,
}

impl SuccessResponse {
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            success: true,
            todos: None,
        }
    }

    #[must_use]
    pub const fn with_todos(todos: Vec<Task>) -> Self {
        Self {
            success: true,
            todos: Some(todos),
        }
    }
}

/// Error reply, sent with a 4xx or 5xx status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Persisted state of one registered peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub peer_id: String,
    #[serde(default)]
    pub connected_peers: Vec<String>,
    pub last_sync: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
}
