//! Client for the REST mirror served by `weektodo-relay`.
//!
//! The mirror is a fallback for devices that have no open peer link: it keeps
//! a per-peer record and a copy of each peer's collection, and `/peer/sync`
//! merges a pushed collection with last-write-wins and returns the result.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use weektodo_proto::rest::{
    ConnectRequest, DisconnectRequest, ErrorResponse, PeerRecord, RegisterRequest, SuccessResponse,
    SyncRequest,
};
use weektodo_proto::task::Task;

use crate::peer::PeerState;

/// Errors from talking to the REST mirror.
#[derive(Debug, thiserror::Error)]
pub enum RestError {
    /// The request could not be sent or the body could not be read.
    #[error("REST request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The mirror answered with a non-success status.
    #[error("REST mirror returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// The `error` field of the reply, or the raw body.
        message: String,
    },

    /// The operation needs a prior successful [`RestClient::register`].
    #[error("not registered with the REST mirror")]
    NotLoggedIn,
}

/// HTTP client for one REST mirror.
#[derive(Debug)]
pub struct RestClient {
    base: String,
    http: reqwest::Client,
    registered: AtomicBool,
}

impl RestClient {
    /// Creates a client for the mirror at `base` (e.g. `http://host:9000`).
    pub fn new(base: &url::Url) -> Self {
        Self {
            base: base.as_str().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            registered: AtomicBool::new(false),
        }
    }

    /// Base URL of the mirror.
    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Whether [`RestClient::register`] succeeded on this client.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Announces this peer and its device metadata.
    ///
    /// # Errors
    ///
    /// [`RestError::Http`] or [`RestError::Status`].
    pub async fn register(&self, state: &PeerState) -> Result<(), RestError> {
        let body = RegisterRequest {
            peer_id: state.peer_id.clone(),
            device_name: state.device_name.clone(),
            device_type: state.device_type.clone(),
        };
        let _: SuccessResponse = self.post("/peer/register", &body).await?;
        self.registered.store(true, Ordering::SeqCst);
        tracing::info!(peer_id = %state.peer_id, url = %self.base, "registered with REST mirror");
        Ok(())
    }

    /// Records that `source` talks to `target`. Both must be registered.
    ///
    /// # Errors
    ///
    /// [`RestError::NotLoggedIn`] before registration, [`RestError::Status`]
    /// with 404 if either peer is unknown to the mirror.
    pub async fn connect(&self, source: &str, target: &str) -> Result<(), RestError> {
        self.require_registered()?;
        let body = ConnectRequest {
            source_peer_id: source.to_string(),
            target_peer_id: target.to_string(),
        };
        let _: SuccessResponse = self.post("/peer/connect", &body).await?;
        Ok(())
    }

    /// Pushes the local collection and returns the mirror's merged collection.
    ///
    /// # Errors
    ///
    /// [`RestError::NotLoggedIn`] before registration, otherwise transport
    /// or status errors.
    pub async fn sync(&self, peer_id: &str, todos: Vec<Task>) -> Result<Vec<Task>, RestError> {
        self.require_registered()?;
        let body = SyncRequest {
            peer_id: peer_id.to_string(),
            timestamp: Utc::now(),
            todos,
        };
        let reply: SuccessResponse = self.post("/peer/sync", &body).await?;
        let merged = reply.todos.unwrap_or_default();
        tracing::debug!(peer_id, count = merged.len(), "REST sync returned");
        Ok(merged)
    }

    /// Removes `from` from this peer's record on the mirror.
    ///
    /// # Errors
    ///
    /// [`RestError::NotLoggedIn`] before registration, otherwise transport
    /// or status errors.
    pub async fn disconnect(&self, peer_id: &str, from: &str) -> Result<(), RestError> {
        self.require_registered()?;
        let body = DisconnectRequest {
            peer_id: peer_id.to_string(),
            disconnect_from_peer_id: from.to_string(),
        };
        let _: SuccessResponse = self.post("/peer/disconnect", &body).await?;
        Ok(())
    }

    /// Fetches the mirror's record of `peer_id`.
    ///
    /// # Errors
    ///
    /// [`RestError::Status`] with 404 for an unknown peer.
    pub async fn peer_state(&self, peer_id: &str) -> Result<PeerRecord, RestError> {
        let response = self
            .http
            .get(format!("{}/peer/{peer_id}", self.base))
            .send()
            .await?;
        read_reply(response).await
    }

    fn require_registered(&self) -> Result<(), RestError> {
        if self.is_registered() {
            Ok(())
        } else {
            Err(RestError::NotLoggedIn)
        }
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R, RestError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base))
            .json(body)
            .send()
            .await?;
        read_reply(response).await
    }
}

async fn read_reply<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, RestError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body).map_or(body, |e| e.error);
    Err(RestError::Status {
        status: status.as_u16(),
        message,
    })
}
