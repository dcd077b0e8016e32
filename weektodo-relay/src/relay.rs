//! Relay server core: shared state, WebSocket handler, link routing, and the
//! server entry points.
//!
//! Peers hold one WebSocket each and register a peerId on it. Link frames
//! (`Open`, `Accept`, `Data`, `Close`) are forwarded to the peer named in
//! `to`, with `from` overwritten by the sender's registered id. A frame for a
//! peer that is not registered is answered with `Unavailable`. When a peer's
//! socket goes away, every peer it had a link with receives a `Close` on its
//! behalf. Nothing is queued: a sync link only exists while both ends are
//! online.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};
use weektodo_proto::relay::{self, RelayMessage};

use crate::registry::PeerRegistry;

/// Default maximum allowed `Data` payload size in bytes (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

struct Registration {
    generation: u64,
    sender: mpsc::UnboundedSender<Message>,
}

/// Shared relay server state: live sockets, open links, and the REST
/// mirror's peer registry.
pub struct RelayState {
    connections: RwLock<HashMap<String, Registration>>,
    links: RwLock<HashMap<String, HashSet<String>>>,
    next_generation: AtomicU64,
    /// Peer records behind the REST mirror.
    pub registry: PeerRegistry,
    max_payload_size: usize,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates an empty state with the default payload limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Creates an empty state with a custom payload limit.
    #[must_use]
    pub fn with_config(max_payload_size: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            links: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            registry: PeerRegistry::new(),
            max_payload_size,
        }
    }

    /// Registers a peer socket and returns its generation.
    ///
    /// A second registration of the same peerId replaces the first; the old
    /// sender is dropped, which ends the old socket's writer.
    pub async fn register(&self, peer_id: &str, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let old = self
            .connections
            .write()
            .await
            .insert(peer_id.to_string(), Registration { generation, sender });
        if old.is_some() {
            tracing::info!(peer_id = %peer_id, "replaced existing connection (duplicate register)");
        }
        generation
    }

    /// Removes the registration of `peer_id` if it is still `generation`.
    /// Returns whether it was removed.
    pub async fn unregister(&self, peer_id: &str, generation: u64) -> bool {
        let mut conns = self.connections.write().await;
        if conns.get(peer_id).is_some_and(|r| r.generation == generation) {
            conns.remove(peer_id);
            true
        } else {
            false
        }
    }

    /// Returns a clone of the sender for the given peer, if registered.
    pub async fn get_sender(&self, peer_id: &str) -> Option<mpsc::UnboundedSender<Message>> {
        self.connections
            .read()
            .await
            .get(peer_id)
            .map(|r| r.sender.clone())
    }

    /// Whether `peer_id` has a live socket.
    pub async fn is_registered(&self, peer_id: &str) -> bool {
        self.connections.read().await.contains_key(peer_id)
    }

    /// Peers `peer_id` currently has a link with.
    pub async fn partners(&self, peer_id: &str) -> Vec<String> {
        let mut partners: Vec<String> = self
            .links
            .read()
            .await
            .get(peer_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        partners.sort();
        partners
    }

    async fn link(&self, a: &str, b: &str) {
        let mut links = self.links.write().await;
        links.entry(a.to_string()).or_default().insert(b.to_string());
        links.entry(b.to_string()).or_default().insert(a.to_string());
    }

    async fn unlink(&self, a: &str, b: &str) {
        let mut links = self.links.write().await;
        for (x, y) in [(a, b), (b, a)] {
            if let Some(set) = links.get_mut(x) {
                set.remove(y);
                if set.is_empty() {
                    links.remove(x);
                }
            }
        }
    }

    /// Drops every link of `peer_id` and returns the former partners.
    async fn unlink_all(&self, peer_id: &str) -> Vec<String> {
        let mut links = self.links.write().await;
        let partners: Vec<String> = links
            .remove(peer_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for partner in &partners {
            if let Some(set) = links.get_mut(partner) {
                set.remove(peer_id);
                if set.is_empty() {
                    links.remove(partner);
                }
            }
        }
        partners
    }

    /// Send a WebSocket Close frame to all connected peers.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (peer_id, reg) in conns.iter() {
            tracing::info!(peer_id = %peer_id, "sending close frame to peer");
            let _ = reg.sender.send(Message::Close(None));
        }
    }
}

/// Handles an upgraded WebSocket connection for a single peer.
///
/// 1. Wait for a `Register` message.
/// 2. Register the peer and send `Registered` back.
/// 3. Route link frames until the socket closes.
/// 4. Unregister and close the peer's links on its partners.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(peer_id) = wait_for_register(&mut ws_receiver).await else {
        tracing::warn!("connection closed before registration");
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let generation = state.register(&peer_id, tx).await;

    let ack = RelayMessage::Registered {
        peer_id: peer_id.clone(),
    };
    if let Err(e) = send_relay_msg(&mut ws_sender, &ack).await {
        tracing::error!(peer_id = %peer_id, error = %e, "failed to send Registered ack");
        state.unregister(&peer_id, generation).await;
        return;
    }
    tracing::info!(peer_id = %peer_id, "peer registered");

    let writer_peer_id = peer_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(peer_id = %writer_peer_id, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_peer_id = peer_id.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    handle_binary_message(&reader_peer_id, &data, &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(peer_id = %reader_peer_id, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    if state.unregister(&peer_id, generation).await {
        for partner in state.unlink_all(&peer_id).await {
            tracing::debug!(peer_id = %peer_id, partner = %partner, "closing link of departed peer");
            let close = RelayMessage::Close {
                from: peer_id.clone(),
                to: partner.clone(),
            };
            send_to_peer(&state, &partner, &close).await;
        }
        tracing::info!(peer_id = %peer_id, "peer disconnected and unregistered");
    }
}

/// Waits for the first binary frame, expecting a `Register` message.
async fn wait_for_register(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<String> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => match relay::decode(&data) {
                Ok(RelayMessage::Register { peer_id }) => {
                    if peer_id.is_empty() {
                        tracing::warn!("received Register with empty peer_id");
                        return None;
                    }
                    return Some(peer_id);
                }
                Ok(other) => {
                    tracing::warn!(msg = ?other, "expected Register, got different message");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode registration message");
                    return None;
                }
            },
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Handles a binary WebSocket message from a registered peer.
async fn handle_binary_message(peer_id: &str, data: &[u8], state: &Arc<RelayState>) {
    let msg = match relay::decode(data) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(peer_id = %peer_id, error = %e, "failed to decode message");
            return;
        }
    };

    if let RelayMessage::Register { peer_id: new_id } = &msg {
        tracing::warn!(peer_id = %peer_id, new_id = %new_id, "duplicate Register on a registered socket");
        return;
    }
    let Some(target) = msg.target().map(str::to_string) else {
        tracing::warn!(peer_id = %peer_id, msg = ?msg, "unexpected message type from client");
        return;
    };

    if let RelayMessage::Data { payload, .. } = &msg
        && payload.len() > state.max_payload_size
    {
        tracing::warn!(
            peer_id = %peer_id,
            size = payload.len(),
            max = state.max_payload_size,
            "payload exceeds size limit"
        );
        let err = RelayMessage::Error {
            reason: format!(
                "payload too large: {} bytes (max {})",
                payload.len(),
                state.max_payload_size
            ),
        };
        send_to_peer(state, peer_id, &err).await;
        return;
    }

    // The registered id is authoritative; a spoofed `from` is overwritten.
    let msg = msg.with_sender(peer_id);
    match &msg {
        RelayMessage::Open { .. } | RelayMessage::Accept { .. } => state.link(peer_id, &target).await,
        RelayMessage::Close { .. } => state.unlink(peer_id, &target).await,
        _ => {}
    }
    route(state, peer_id, &target, &msg).await;
}

/// Forwards a link frame to `to`, answering `Unavailable` when `to` has no
/// live socket.
async fn route(state: &Arc<RelayState>, from: &str, to: &str, msg: &RelayMessage) {
    let delivered = match (state.get_sender(to).await, relay::encode(msg)) {
        (Some(sender), Ok(bytes)) => sender.send(Message::Binary(bytes.into())).is_ok(),
        (_, Err(e)) => {
            tracing::error!(error = %e, "failed to encode relay frame for forwarding");
            return;
        }
        (None, _) => false,
    };

    if delivered {
        tracing::debug!(from = %from, to = %to, "routed link frame");
        return;
    }
    tracing::debug!(from = %from, to = %to, "target unavailable");
    state.unlink(from, to).await;
    if !matches!(msg, RelayMessage::Close { .. }) {
        let unavailable = RelayMessage::Unavailable { to: to.to_string() };
        send_to_peer(state, from, &unavailable).await;
    }
}

/// Sends a relay message to a registered peer via its channel.
async fn send_to_peer(state: &Arc<RelayState>, peer_id: &str, msg: &RelayMessage) {
    if let Some(sender) = state.get_sender(peer_id).await
        && let Ok(bytes) = relay::encode(msg)
    {
        let _ = sender.send(Message::Binary(bytes.into()));
    }
}

/// Encodes and sends a relay message directly on a WebSocket sender.
async fn send_relay_msg(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    msg: &RelayMessage,
) -> Result<(), String> {
    let bytes = relay::encode(msg)?;
    ws_sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Builds the full router: `/ws` for links plus the REST mirror.
pub fn router(state: Arc<RelayState>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .merge(crate::api::routes())
        .with_state(state)
}

/// Starts the relay server on the given address and returns the bound address
/// and a join handle.
///
/// This is the primary entry point used by both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
