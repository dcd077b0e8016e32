//! REST mirror endpoints.
//!
//! | route | body | reply |
//! |---|---|---|
//! | `POST /peer/register` | `RegisterRequest` | `{success}` |
//! | `POST /peer/connect` | `ConnectRequest` | `{success}`, 404 for an unknown peer |
//! | `POST /peer/sync` | `SyncRequest` | `{success, todos}` with the merged collection |
//! | `POST /peer/disconnect` | `DisconnectRequest` | `{success}` |
//! | `GET /peer/{peerId}` | none | `PeerRecord` |
//!
//! Failures reply `{error}` with a 4xx status.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use weektodo_proto::rest::{
    ConnectRequest, DisconnectRequest, ErrorResponse, PeerRecord, RegisterRequest, SuccessResponse,
    SyncRequest,
};

use crate::registry::RegistryError;
use crate::relay::RelayState;

/// Error reply of a mirror endpoint.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let status = match e {
            RegistryError::UnknownPeer(_) => StatusCode::NOT_FOUND,
            RegistryError::Empty(_) => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

/// Routes of the REST mirror, to be merged into the server router.
pub fn routes() -> Router<Arc<RelayState>> {
    Router::new()
        .route("/peer/register", post(register))
        .route("/peer/connect", post(connect))
        .route("/peer/sync", post(sync))
        .route("/peer/disconnect", post(disconnect))
        .route("/peer/{peer_id}", get(peer_state))
}

async fn register(
    State(state): State<Arc<RelayState>>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let Json(req) = body?;
    let record = state.registry.register(req).await?;
    tracing::info!(peer_id = %record.peer_id, "peer registered with mirror");
    Ok(Json(SuccessResponse::ok()))
}

async fn connect(
    State(state): State<Arc<RelayState>>,
    body: Result<Json<ConnectRequest>, JsonRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let Json(req) = body?;
    state
        .registry
        .connect(&req.source_peer_id, &req.target_peer_id)
        .await
        .inspect_err(|e| tracing::debug!(err = %e, "mirror connect refused"))?;
    tracing::debug!(from = %req.source_peer_id, to = %req.target_peer_id, "mirror connect");
    Ok(Json(SuccessResponse::ok()))
}

async fn sync(
    State(state): State<Arc<RelayState>>,
    body: Result<Json<SyncRequest>, JsonRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let Json(req) = body?;
    let merged = state
        .registry
        .sync(&req.peer_id, &req.todos, req.timestamp)
        .await?;
    tracing::info!(peer_id = %req.peer_id, count = merged.len(), "mirror sync");
    Ok(Json(SuccessResponse::with_todos(merged)))
}

async fn disconnect(
    State(state): State<Arc<RelayState>>,
    body: Result<Json<DisconnectRequest>, JsonRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let Json(req) = body?;
    state
        .registry
        .disconnect(&req.peer_id, &req.disconnect_from_peer_id)
        .await?;
    Ok(Json(SuccessResponse::ok()))
}

async fn peer_state(
    State(state): State<Arc<RelayState>>,
    Path(peer_id): Path<String>,
) -> Result<Json<PeerRecord>, ApiError> {
    state
        .registry
        .get(&peer_id)
        .await
        .map(Json)
        .ok_or_else(|| RegistryError::UnknownPeer(peer_id).into())
}
