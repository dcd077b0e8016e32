//! Peer links brokered by a `WeekTodo` relay over WebSocket.
//!
//! Used when two peers cannot reach each other directly. Both sides hold a
//! WebSocket to the relay and register their peerId; a link is then an
//! `Open` / `Accept` exchange followed by `Data` frames in both directions
//! and a `Close` from whichever side hangs up first. Many links share one
//! socket. The relay only reads routing metadata, never payloads.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use weektodo_proto::relay::{self, RelayMessage};

use super::{Link, PeerId, Transport, TransportError, TransportType};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSender = futures_util::stream::SplitSink<WsStream, Message>;
type WsReader = futures_util::stream::SplitStream<WsStream>;

/// Default timeout for connecting to the relay server.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for waiting for a `Registered` acknowledgment from the server.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames buffered per link and direction.
const LINK_CAPACITY: usize = 256;

type Pending = HashMap<PeerId, oneshot::Sender<Result<(), TransportError>>>;

/// State shared by the transport, its reader task, and its link pumps.
struct Shared {
    local: PeerId,
    frames: mpsc::UnboundedSender<RelayMessage>,
    links: Mutex<HashMap<PeerId, (u64, mpsc::Sender<Vec<u8>>)>>,
    pending: Mutex<Pending>,
    next_link: AtomicU64,
    connected: AtomicBool,
}

impl Shared {
    fn send_frame(&self, msg: RelayMessage) -> Result<(), TransportError> {
        self.frames
            .send(msg)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Registers a link to `peer` and starts pumping its outbound frames.
    fn establish(self: &Arc<Self>, peer: PeerId) -> Link {
        let (in_tx, in_rx) = mpsc::channel(LINK_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(LINK_CAPACITY);
        let link_id = self.next_link.fetch_add(1, Ordering::Relaxed);
        if self
            .links
            .lock()
            .insert(peer.clone(), (link_id, in_tx))
            .is_some()
        {
            tracing::debug!(peer_id = %peer, "replacing existing relay link");
        }
        tokio::spawn(pump(Arc::clone(self), peer.clone(), link_id, out_rx));
        Link {
            remote: peer,
            outbound: out_tx,
            inbound: in_rx,
        }
    }

    /// Hands an inbound payload to its link without waiting. A link whose
    /// consumer has stopped or fallen `LINK_CAPACITY` frames behind is closed
    /// so it cannot stall the other links on the socket.
    fn deliver(&self, peer: &PeerId, payload: Vec<u8>) {
        let Some((link_id, tx)) = self.links.lock().get(peer).cloned() else {
            tracing::debug!(peer_id = %peer, "data for unknown relay link, dropped");
            return;
        };
        let reason = match tx.try_send(payload) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(_)) => "link consumer fell behind",
            Err(mpsc::error::TrySendError::Closed(_)) => "link consumer gone",
        };
        tracing::warn!(peer_id = %peer, capacity = LINK_CAPACITY, reason, "closing relay link");
        self.close_link(peer, link_id);
    }

    /// Drops link `link_id` to `peer` if it is still current and tells the
    /// remote side.
    fn close_link(&self, peer: &PeerId, link_id: u64) {
        let removed = {
            let mut links = self.links.lock();
            match links.get(peer) {
                Some((id, _)) if *id == link_id => links.remove(peer).is_some(),
                _ => false,
            }
        };
        if removed {
            let _ = self.send_frame(RelayMessage::Close {
                from: self.local.as_str().to_string(),
                to: peer.as_str().to_string(),
            });
        }
    }

    fn shut_down(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.links.lock().clear();
        for (_, waiter) in self.pending.lock().drain() {
            let _ = waiter.send(Err(TransportError::ConnectionClosed));
        }
    }
}

/// Forwards one link's outbound frames as `Data`, then sends `Close` if the
/// link is still the current one for that peer when the local side hangs up.
async fn pump(shared: Arc<Shared>, peer: PeerId, link_id: u64, mut out_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(payload) = out_rx.recv().await {
        let frame = RelayMessage::Data {
            from: shared.local.as_str().to_string(),
            to: peer.as_str().to_string(),
            payload,
        };
        if shared.send_frame(frame).is_err() {
            return;
        }
    }

    tracing::debug!(peer_id = %peer, "local side hung up relay link");
    shared.close_link(&peer, link_id);
}

/// WebSocket relay transport implementing the [`Transport`] trait.
///
/// Created via [`RelayTransport::connect`], which establishes the WebSocket
/// connection, registers with the relay, and spawns background reader and
/// writer tasks.
pub struct RelayTransport {
    shared: Arc<Shared>,
    relay_url: String,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Link>>,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl RelayTransport {
    /// Connect to a relay server and register this peer.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if connection or registration times out.
    /// - [`TransportError::Unreachable`] if the relay cannot be connected.
    /// - [`TransportError::Rejected`] if the relay refuses the registration.
    /// - [`TransportError::Io`] for TLS or WebSocket failures.
    pub async fn connect(relay_url: &str, local_id: PeerId) -> Result<Self, TransportError> {
        let (ws_stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(relay_url))
            .await
            .map_err(|_| {
                tracing::warn!(url = relay_url, "relay WebSocket connect timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url = relay_url, err = %e, "relay WebSocket connect failed");
                map_ws_connect_error(e)
            })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let register = RelayMessage::Register {
            peer_id: local_id.as_str().to_string(),
        };
        let bytes = relay::encode(&register).map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
        ws_sender
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(format!("failed to send Register: {e}"))))?;

        let ack = tokio::time::timeout(REGISTER_TIMEOUT, ws_reader.next())
            .await
            .map_err(|_| {
                tracing::warn!(url = relay_url, "relay registration acknowledgment timed out");
                TransportError::Timeout
            })?;
        expect_registered(ack)?;
        tracing::info!(peer_id = %local_id, url = relay_url, "registered with relay server");

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (accepted_tx, accepted_rx) = mpsc::channel(LINK_CAPACITY);
        let shared = Arc::new(Shared {
            local: local_id,
            frames: frames_tx,
            links: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_link: AtomicU64::new(0),
            connected: AtomicBool::new(true),
        });

        let writer_handle = tokio::spawn(writer_loop(ws_sender, frames_rx, Arc::clone(&shared)));
        let reader_handle = tokio::spawn(reader_loop(ws_reader, Arc::clone(&shared), accepted_tx));

        Ok(Self {
            shared,
            relay_url: relay_url.to_string(),
            incoming: tokio::sync::Mutex::new(accepted_rx),
            reader_handle,
            writer_handle,
        })
    }

    /// Return the relay server URL this transport is connected to.
    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// Return the local peer ID.
    pub fn local_id(&self) -> &PeerId {
        &self.shared.local
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
        self.shared.shut_down();
    }
}

impl Transport for RelayTransport {
    async fn open(&self, peer: &PeerId) -> Result<Link, TransportError> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(peer.clone(), tx);
        self.shared.send_frame(RelayMessage::Open {
            from: self.shared.local.as_str().to_string(),
            to: peer.as_str().to_string(),
        })?;

        match rx.await {
            Ok(Ok(())) => Ok(self.shared.establish(peer.clone())),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::ConnectionClosed),
        }
    }

    async fn accept(&self) -> Result<Link, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn is_online(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Relay
    }
}

fn expect_registered(
    ack: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> Result<(), TransportError> {
    match ack {
        Some(Ok(Message::Binary(data))) => match relay::decode(&data) {
            Ok(RelayMessage::Registered { .. }) => Ok(()),
            Ok(RelayMessage::Error { reason }) => {
                tracing::warn!(reason = %reason, "relay registration rejected");
                Err(TransportError::Rejected(reason))
            }
            Ok(other) => {
                tracing::warn!(?other, "unexpected relay response during registration");
                Err(TransportError::Rejected("unexpected response during registration".into()))
            }
            Err(e) => Err(TransportError::Io(std::io::Error::other(format!(
                "malformed registration response: {e}"
            )))),
        },
        Some(Ok(Message::Close(_))) | None => {
            tracing::warn!("relay closed the connection during registration");
            Err(TransportError::ConnectionClosed)
        }
        Some(Ok(_)) => Err(TransportError::Io(std::io::Error::other(
            "unexpected non-binary frame during registration",
        ))),
        Some(Err(e)) => Err(TransportError::Io(std::io::Error::other(format!(
            "WebSocket error during registration: {e}"
        )))),
    }
}

/// Drains queued frames onto the socket.
async fn writer_loop(
    mut ws_sender: WsSender,
    mut frames: mpsc::UnboundedReceiver<RelayMessage>,
    shared: Arc<Shared>,
) {
    while let Some(msg) = frames.recv().await {
        let bytes = match relay::encode(&msg) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(err = %e, "dropping unencodable relay frame");
                continue;
            }
        };
        if let Err(e) = ws_sender.send(Message::Binary(bytes.into())).await {
            tracing::warn!(err = %e, "relay send failed");
            break;
        }
    }
    shared.shut_down();
    let _ = ws_sender.close().await;
}

/// Dispatches broker frames to links until the socket closes.
///
/// Malformed frames are logged and skipped; the socket stays up.
async fn reader_loop(mut ws_reader: WsReader, shared: Arc<Shared>, accepted: mpsc::Sender<Link>) {
    while let Some(msg_result) = ws_reader.next().await {
        let data = match msg_result {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => {
                tracing::info!("relay WebSocket closed by server");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(err = %e, "relay WebSocket read error");
                break;
            }
        };

        match relay::decode(&data) {
            Ok(RelayMessage::Open { from, .. }) => {
                let peer = PeerId::new(from);
                tracing::debug!(peer_id = %peer, "accepting relay link");
                let link = shared.establish(peer.clone());
                let _ = shared.send_frame(RelayMessage::Accept {
                    from: shared.local.as_str().to_string(),
                    to: peer.as_str().to_string(),
                });
                // Dropping an unaccepted link closes it through its pump.
                if let Err(e) = accepted.try_send(link) {
                    tracing::warn!(peer_id = %peer, err = %e, "incoming relay link not taken");
                }
            }
            Ok(RelayMessage::Accept { from, .. }) => {
                let peer = PeerId::new(from);
                let waiter = shared.pending.lock().remove(&peer);
                let delivered = waiter.is_some_and(|w| w.send(Ok(())).is_ok());
                if !delivered {
                    // The dialer gave up before the answer came back.
                    let _ = shared.send_frame(RelayMessage::Close {
                        from: shared.local.as_str().to_string(),
                        to: peer.as_str().to_string(),
                    });
                }
            }
            Ok(RelayMessage::Data { from, payload, .. }) => {
                shared.deliver(&PeerId::new(from), payload);
            }
            Ok(RelayMessage::Close { from, .. }) => {
                let peer = PeerId::new(from);
                if shared.links.lock().remove(&peer).is_some() {
                    tracing::debug!(peer_id = %peer, "relay link closed by remote");
                }
            }
            Ok(RelayMessage::Unavailable { to }) => {
                let peer = PeerId::new(to);
                if let Some(waiter) = shared.pending.lock().remove(&peer) {
                    let _ = waiter.send(Err(TransportError::Unreachable(peer.clone())));
                }
                shared.links.lock().remove(&peer);
            }
            Ok(RelayMessage::Error { reason }) => {
                tracing::warn!(reason = %reason, "relay server error");
            }
            Ok(other) => {
                tracing::debug!(?other, "unexpected relay message type");
            }
            Err(e) => {
                tracing::warn!(err = %e, "malformed relay frame, skipping");
            }
        }
    }
    shared.shut_down();
    tracing::info!("relay reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(PeerId::new("relay"))
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Http(response) => TransportError::Rejected(format!(
            "relay HTTP error: status {}",
            response.status()
        )),
        other => TransportError::Io(std::io::Error::other(format!(
            "relay connection error: {other}"
        ))),
    }
}
