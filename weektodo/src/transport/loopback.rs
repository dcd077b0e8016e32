//! Loopback transport for testing.
//!
//! A [`LoopbackNetwork`] is an in-process hub. Each peer registers an endpoint
//! with [`LoopbackNetwork::endpoint`] and gets a [`LoopbackTransport`]; opening
//! a link wires two pairs of [`tokio::sync::mpsc`] channels between the two
//! endpoints. The hub can also misbehave on purpose: a silent endpoint never
//! answers a handshake, and [`LoopbackNetwork::sever`] drops every link a peer
//! holds, which is how tests simulate a network failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Link, PeerId, Transport, TransportError, TransportType};

struct Endpoint {
    incoming: mpsc::Sender<Link>,
    silent: bool,
    online: Arc<AtomicBool>,
    severed: CancellationToken,
}

#[derive(Default)]
struct Hub {
    endpoints: HashMap<PeerId, Endpoint>,
}

/// In-process hub connecting [`LoopbackTransport`] endpoints.
#[derive(Clone)]
pub struct LoopbackNetwork {
    hub: Arc<Mutex<Hub>>,
    capacity: usize,
}

impl LoopbackNetwork {
    /// Creates an empty hub whose link channels hold `capacity` frames each.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub::default())),
            capacity: capacity.max(1),
        }
    }

    /// Registers `id` on the hub, replacing any previous endpoint of that name.
    #[must_use]
    pub fn endpoint(&self, id: impl Into<PeerId>) -> LoopbackTransport {
        let id = id.into();
        let (tx, rx) = mpsc::channel(self.capacity);
        let online = Arc::new(AtomicBool::new(true));
        let previous = self.hub.lock().endpoints.insert(
            id.clone(),
            Endpoint {
                incoming: tx,
                silent: false,
                online: Arc::clone(&online),
                severed: CancellationToken::new(),
            },
        );
        if let Some(old) = previous {
            old.severed.cancel();
        }
        LoopbackTransport {
            local: id,
            network: self.clone(),
            incoming: tokio::sync::Mutex::new(rx),
            online,
        }
    }

    /// Makes `id` ignore handshakes: links opened to it never complete.
    pub fn set_silent(&self, id: &PeerId, silent: bool) {
        if let Some(ep) = self.hub.lock().endpoints.get_mut(id) {
            ep.silent = silent;
        }
    }

    /// Drops every link `id` currently holds. New links can still be opened.
    pub fn sever(&self, id: &PeerId) {
        if let Some(ep) = self.hub.lock().endpoints.get_mut(id) {
            let old = std::mem::replace(&mut ep.severed, CancellationToken::new());
            old.cancel();
        }
    }

    /// Takes `id` off or back on the network. Going offline severs its links.
    pub fn set_online(&self, id: &PeerId, online: bool) {
        let flag = self
            .hub
            .lock()
            .endpoints
            .get(id)
            .map(|ep| Arc::clone(&ep.online));
        if let Some(flag) = flag {
            flag.store(online, Ordering::SeqCst);
        }
        if !online {
            self.sever(id);
        }
    }

    /// Unregisters `id`. Its pending `accept` returns `ConnectionClosed`.
    pub fn remove(&self, id: &PeerId) {
        if let Some(ep) = self.hub.lock().endpoints.remove(id) {
            ep.severed.cancel();
        }
    }

    fn pipe(&self, a: &PeerId, b: &PeerId, cuts: [CancellationToken; 2]) -> (Link, Link) {
        let (a_out, a_out_rx) = mpsc::channel(self.capacity);
        let (b_in_tx, b_in) = mpsc::channel(self.capacity);
        let (b_out, b_out_rx) = mpsc::channel(self.capacity);
        let (a_in_tx, a_in) = mpsc::channel(self.capacity);

        tokio::spawn(forward(a_out_rx, b_in_tx, cuts.clone()));
        tokio::spawn(forward(b_out_rx, a_in_tx, cuts));

        (
            Link {
                remote: b.clone(),
                outbound: a_out,
                inbound: a_in,
            },
            Link {
                remote: a.clone(),
                outbound: b_out,
                inbound: b_in,
            },
        )
    }
}

/// Moves frames from one side of a link to the other until either side
/// closes or either endpoint is severed.
async fn forward(
    mut rx: mpsc::Receiver<Vec<u8>>,
    tx: mpsc::Sender<Vec<u8>>,
    cuts: [CancellationToken; 2],
) {
    let [cut_a, cut_b] = cuts;
    loop {
        tokio::select! {
            () = cut_a.cancelled() => break,
            () = cut_b.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

/// One peer's view of a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    local: PeerId,
    network: LoopbackNetwork,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Link>>,
    online: Arc<AtomicBool>,
}

impl LoopbackTransport {
    /// This endpoint's identity on the hub.
    #[must_use]
    pub const fn local_id(&self) -> &PeerId {
        &self.local
    }
}

impl Transport for LoopbackTransport {
    async fn open(&self, peer: &PeerId) -> Result<Link, TransportError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(peer.clone()));
        }

        let (incoming, silent, cuts) = {
            let hub = self.network.hub.lock();
            let remote = hub
                .endpoints
                .get(peer)
                .filter(|ep| ep.online.load(Ordering::SeqCst))
                .ok_or_else(|| TransportError::Unreachable(peer.clone()))?;
            let local_cut = hub
                .endpoints
                .get(&self.local)
                .map_or_else(CancellationToken::new, |ep| ep.severed.clone());
            (
                remote.incoming.clone(),
                remote.silent,
                [local_cut, remote.severed.clone()],
            )
        };

        if silent {
            tracing::debug!(peer_id = %peer, "loopback peer is silent, handshake pending");
            return std::future::pending().await;
        }

        let (local_link, remote_link) = self.network.pipe(&self.local, peer, cuts);
        incoming
            .send(remote_link)
            .await
            .map_err(|_| TransportError::Unreachable(peer.clone()))?;
        Ok(local_link)
    }

    async fn accept(&self) -> Result<Link, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn open_and_accept_exchange_frames() {
        let net = LoopbackNetwork::new(8);
        let alice = net.endpoint("alice");
        let bob = net.endpoint("bob");

        let mut a = alice.open(&PeerId::new("bob")).await.unwrap();
        let mut b = bob.accept().await.unwrap();
        assert_eq!(b.remote, PeerId::new("alice"));

        a.outbound.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(b.inbound.recv().await.unwrap(), b"ping");
        b.outbound.send(b"pong".to_vec()).await.unwrap();
        assert_eq!(a.inbound.recv().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn open_unknown_peer_is_unreachable() {
        let net = LoopbackNetwork::new(8);
        let alice = net.endpoint("alice");
        let err = alice.open(&PeerId::new("nobody")).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(p) if p.as_str() == "nobody"));
    }

    #[tokio::test]
    async fn dropping_outbound_closes_remote_inbound() {
        let net = LoopbackNetwork::new(8);
        let alice = net.endpoint("alice");
        let bob = net.endpoint("bob");

        let a = alice.open(&PeerId::new("bob")).await.unwrap();
        let mut b = bob.accept().await.unwrap();
        drop(a);
        assert!(b.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn sever_closes_both_directions() {
        let net = LoopbackNetwork::new(8);
        let alice = net.endpoint("alice");
        let bob = net.endpoint("bob");

        let mut a = alice.open(&PeerId::new("bob")).await.unwrap();
        let mut b = bob.accept().await.unwrap();
        net.sever(&PeerId::new("bob"));
        assert!(a.inbound.recv().await.is_none());
        assert!(b.inbound.recv().await.is_none());

        // The hub still accepts new links after a sever.
        let _again = alice.open(&PeerId::new("bob")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_never_completes_handshake() {
        let net = LoopbackNetwork::new(8);
        let alice = net.endpoint("alice");
        let _bob = net.endpoint("bob");
        net.set_silent(&PeerId::new("bob"), true);

        let result =
            tokio::time::timeout(Duration::from_secs(60), alice.open(&PeerId::new("bob"))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn offline_endpoint_cannot_open() {
        let net = LoopbackNetwork::new(8);
        let alice = net.endpoint("alice");
        let _bob = net.endpoint("bob");
        net.set_online(&PeerId::new("alice"), false);
        assert!(!alice.is_online());
        assert!(alice.open(&PeerId::new("bob")).await.is_err());
    }
}
