//! Connection lifecycle for one local peer.
//!
//! The manager owns every open [`Link`], keyed by remote peerId. Each link
//! gets a reader task that hands inbound frames, one at a time, to the
//! [`MessageHandler`] and writes any reply back on the same link. When a
//! link ends the reader reports it; if the peer is one this device wants to
//! stay connected to, the [`ReconnectScheduler`] takes over. A periodic
//! health check prunes dead links, reconciles [`SyncStatus`], and re-arms the
//! scheduler for wanted peers that dropped without anyone noticing.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use weektodo_proto::codec;
use weektodo_proto::message::Envelope;

use super::identity::Identity;
use super::reconnect::{HEALTH_CHECK_INTERVAL, ReconnectPolicy, ReconnectScheduler, Redial};
use super::{MessageHandler, PeerError, SyncStatus};
use crate::transport::{Link, PeerId, Transport, TransportError};

/// Default bound on the link handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of the connection to one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A dial is in flight.
    Opening,
    /// The link is up.
    Open,
    /// No link and no dial.
    Closed,
}

/// Tunables of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    /// Bound on a single handshake.
    pub connect_timeout: Duration,
    /// Backoff for lost peers.
    pub reconnect: ReconnectPolicy,
    /// Interval of the health check.
    pub health_interval: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            health_interval: HEALTH_CHECK_INTERVAL,
        }
    }
}

struct Connection {
    generation: u64,
    synced: bool,
    outbound: mpsc::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
}

struct Inner<T, H> {
    this: Weak<Self>,
    transport: T,
    handler: H,
    identity: Arc<Identity>,
    options: ManagerOptions,
    connections: Mutex<HashMap<PeerId, Connection>>,
    dialing: Mutex<HashSet<PeerId>>,
    next_generation: AtomicU64,
    status: watch::Sender<SyncStatus>,
    scheduler: ReconnectScheduler,
    shutdown: CancellationToken,
}

impl<T: Transport, H: MessageHandler> Inner<T, H> {
    fn is_open(&self, peer: &PeerId) -> bool {
        self.connections.lock().contains_key(peer)
    }

    fn refresh_status(&self) {
        let status = if !self.connections.lock().is_empty() {
            SyncStatus::Connected
        } else if !self.dialing.lock().is_empty() {
            SyncStatus::Connecting
        } else {
            SyncStatus::Disconnected
        };
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            tracing::info!(status = %status, "sync status changed");
        }
    }

    async fn dial(self: &Arc<Self>, peer: &PeerId) -> Result<(), PeerError> {
        if self.is_open(peer) {
            return Ok(());
        }

        self.dialing.lock().insert(peer.clone());
        self.refresh_status();
        tracing::debug!(peer_id = %peer, "dialing peer");
        let result = tokio::time::timeout(self.options.connect_timeout, self.transport.open(peer)).await;
        self.dialing.lock().remove(peer);

        let link = match result {
            Ok(Ok(link)) => link,
            Ok(Err(source)) => {
                tracing::warn!(peer_id = %peer, err = %source, "connection failed");
                self.refresh_status();
                return Err(PeerError::ConnectionError {
                    peer: peer.clone(),
                    source,
                });
            }
            Err(_) => {
                tracing::warn!(
                    peer_id = %peer,
                    timeout_secs = self.options.connect_timeout.as_secs(),
                    "connection timed out"
                );
                self.refresh_status();
                return Err(PeerError::ConnectionTimeout(peer.clone()));
            }
        };
        self.register(link);
        Ok(())
    }

    /// Takes ownership of an open link: greets the peer, starts its reader,
    /// and replaces any older link to the same peer.
    fn register(self: &Arc<Self>, link: Link) {
        let Link {
            remote,
            outbound,
            inbound,
        } = link;

        if let Some(greeting) = self.handler.on_open(&remote) {
            match codec::encode(&greeting) {
                Ok(bytes) => {
                    if outbound.try_send(bytes).is_err() {
                        tracing::warn!(peer_id = %remote, "could not queue greeting");
                    }
                }
                Err(e) => tracing::warn!(peer_id = %remote, err = %e, "could not encode greeting"),
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = {
            // Held across the spawn so the reader cannot report a close
            // before its connection is in the map.
            let mut connections = self.connections.lock();
            let reader = tokio::spawn(read_loop(
                Arc::clone(self),
                remote.clone(),
                generation,
                inbound,
                outbound.clone(),
            ));
            connections.insert(
                remote.clone(),
                Connection {
                    generation,
                    synced: false,
                    outbound,
                    reader,
                },
            )
        };
        if let Some(old) = previous {
            old.reader.abort();
            tracing::debug!(peer_id = %remote, "replaced existing connection");
        }
        tracing::info!(peer_id = %remote, "peer connected");
        self.refresh_status();
    }

    fn connection_closed(&self, peer: &PeerId, generation: u64) {
        let removed = {
            let mut connections = self.connections.lock();
            match connections.get(peer) {
                Some(c) if c.generation == generation => connections.remove(peer),
                _ => None,
            }
        };
        if removed.is_none() {
            return;
        }
        tracing::info!(peer_id = %peer, "peer connection closed");
        self.refresh_status();
        if !self.shutdown.is_cancelled() && self.identity.is_remembered(peer) {
            self.scheduler.peer_lost(peer);
        }
    }

    fn mark_synced(&self, peer: &PeerId, generation: u64) {
        if let Some(c) = self
            .connections
            .lock()
            .get_mut(peer)
            .filter(|c| c.generation == generation)
        {
            c.synced = true;
        }
    }

    fn check_health(&self) {
        let dead: Vec<(PeerId, u64)> = self
            .connections
            .lock()
            .iter()
            .filter(|(_, c)| c.outbound.is_closed() || c.reader.is_finished())
            .map(|(p, c)| (p.clone(), c.generation))
            .collect();
        for (peer, generation) in dead {
            tracing::debug!(peer_id = %peer, "health check found dead link");
            self.connection_closed(&peer, generation);
        }
        self.refresh_status();

        if !self.transport.is_online() {
            tracing::debug!("transport offline, not re-arming reconnects");
            return;
        }
        for peer in self.identity.connected_peers() {
            let idle = !self.is_open(&peer)
                && !self.dialing.lock().contains(&peer)
                && self.scheduler.attempts(&peer).is_none();
            if idle {
                tracing::info!(peer_id = %peer, "wanted peer not connected, scheduling reconnect");
                self.scheduler.peer_lost(&peer);
            }
        }
    }
}

impl<T: Transport, H: MessageHandler> Redial for Inner<T, H> {
    async fn redial(&self, peer: &PeerId) -> Result<(), PeerError> {
        let Some(me) = self.this.upgrade() else {
            return Err(PeerError::ConnectionError {
                peer: peer.clone(),
                source: TransportError::ConnectionClosed,
            });
        };
        me.dial(peer).await
    }

    async fn give_up(&self, peer: &PeerId) {
        if self.identity.forget(peer) {
            if let Err(e) = self.identity.persist().await {
                tracing::warn!(peer_id = %peer, err = %e, "could not persist peer removal");
            }
        }
    }
}

/// Feeds one link's frames to the handler until the link or the manager
/// shuts down.
async fn read_loop<T: Transport, H: MessageHandler>(
    inner: Arc<Inner<T, H>>,
    peer: PeerId,
    generation: u64,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
) {
    loop {
        let frame = tokio::select! {
            () = inner.shutdown.cancelled() => return,
            frame = inbound.recv() => frame,
        };
        let Some(frame) = frame else { break };

        let dispatch = inner.handler.on_message(&peer, &frame).await;
        if dispatch.synced {
            inner.mark_synced(&peer, generation);
        }
        if let Some(reply) = dispatch.reply {
            match codec::encode(&reply) {
                Ok(bytes) => {
                    if outbound.send(bytes).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(peer_id = %peer, err = %e, "could not encode reply"),
            }
        }
    }
    drop(outbound);
    inner.connection_closed(&peer, generation);
}

async fn accept_loop<T: Transport, H: MessageHandler>(inner: Arc<Inner<T, H>>) {
    loop {
        let link = tokio::select! {
            () = inner.shutdown.cancelled() => break,
            link = inner.transport.accept() => link,
        };
        match link {
            Ok(link) => {
                tracing::info!(peer_id = %link.remote, "incoming connection");
                inner.register(link);
            }
            Err(e) => {
                tracing::debug!(err = %e, "transport stopped accepting links");
                break;
            }
        }
    }
}

async fn health_loop<T: Transport, H: MessageHandler>(inner: Weak<Inner<T, H>>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.check_health();
            }
        }
    }
}

/// Owns the live connections of the local peer.
///
/// Cloning yields another handle to the same manager.
pub struct ConnectionManager<T, H> {
    inner: Arc<Inner<T, H>>,
}

impl<T, H> Clone for ConnectionManager<T, H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport, H: MessageHandler> ConnectionManager<T, H> {
    /// Creates a manager. Background work stops when `shutdown` is
    /// cancelled. Must be called inside a tokio runtime.
    pub fn new(
        transport: T,
        handler: H,
        identity: Arc<Identity>,
        options: ManagerOptions,
        shutdown: CancellationToken,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::Disconnected);
        let inner = Arc::new_cyclic(|this: &Weak<Inner<T, H>>| Inner {
            this: this.clone(),
            transport,
            handler,
            identity,
            options,
            connections: Mutex::new(HashMap::new()),
            dialing: Mutex::new(HashSet::new()),
            next_generation: AtomicU64::new(0),
            status,
            scheduler: ReconnectScheduler::spawn(this.clone(), options.reconnect, shutdown.child_token()),
            shutdown,
        });
        Self { inner }
    }

    /// Starts accepting incoming links and probing connection health.
    pub fn start(&self) {
        tokio::spawn(accept_loop(Arc::clone(&self.inner)));
        tokio::spawn(health_loop(
            Arc::downgrade(&self.inner),
            self.inner.options.health_interval,
            self.inner.shutdown.clone(),
        ));
    }

    /// Opens a connection to `target`, or, without a target, only makes sure
    /// the local identity exists on disk. Returns the peerId that was
    /// connected (or the local one).
    ///
    /// The target joins the set of peers to stay connected to before the
    /// dial, so a failure hands it to the reconnect scheduler.
    ///
    /// # Errors
    ///
    /// - [`PeerError::ConnectionTimeout`] if the handshake exceeds the timeout.
    /// - [`PeerError::ConnectionError`] if the transport refuses the link.
    /// - [`PeerError::Identity`] if the identity cannot be saved.
    pub async fn connect(&self, target: Option<&PeerId>) -> Result<PeerId, PeerError> {
        let inner = &self.inner;
        inner.identity.ensure_persisted().await?;
        let Some(target) = target else {
            return Ok(inner.identity.peer_id());
        };
        if *target == inner.identity.peer_id() {
            return Err(PeerError::ConnectionError {
                peer: target.clone(),
                source: TransportError::Rejected("cannot connect to self".into()),
            });
        }

        if inner.identity.remember(target) {
            if let Err(e) = inner.identity.persist().await {
                tracing::warn!(peer_id = %target, err = %e, "could not persist connected peers");
            }
        }
        inner.scheduler.cancel(target);

        match inner.dial(target).await {
            Ok(()) => Ok(target.clone()),
            Err(e) => {
                if !inner.shutdown.is_cancelled() {
                    inner.scheduler.peer_lost(target);
                }
                Err(e)
            }
        }
    }

    /// Closes the connection to `target` (or to everyone), forgets it, and
    /// cancels any pending reconnect.
    pub async fn disconnect(&self, target: Option<&PeerId>) {
        let inner = &self.inner;
        let peers: BTreeSet<PeerId> = match target {
            Some(peer) => BTreeSet::from([peer.clone()]),
            None => {
                inner.scheduler.cancel_all();
                let mut all: BTreeSet<PeerId> = inner.identity.connected_peers().into_iter().collect();
                all.extend(inner.connections.lock().keys().cloned());
                all
            }
        };

        for peer in &peers {
            inner.scheduler.cancel(peer);
            inner.identity.forget(peer);
            let removed = inner.connections.lock().remove(peer);
            if let Some(conn) = removed {
                conn.reader.abort();
                tracing::info!(peer_id = %peer, "disconnected from peer");
            }
        }
        if let Err(e) = inner.identity.persist().await {
            tracing::warn!(err = %e, "could not persist connected peers");
        }
        inner.refresh_status();
    }

    /// Sends `envelope` on every open connection. Returns how many
    /// connections it was queued on.
    pub async fn broadcast(&self, envelope: &Envelope) -> usize {
        let bytes = match codec::encode(envelope) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(err = %e, "could not encode broadcast");
                return 0;
            }
        };
        let targets: Vec<(PeerId, mpsc::Sender<Vec<u8>>)> = self
            .inner
            .connections
            .lock()
            .iter()
            .filter(|(_, c)| !c.outbound.is_closed())
            .map(|(p, c)| (p.clone(), c.outbound.clone()))
            .collect();

        let mut sent = 0;
        for (peer, tx) in targets {
            if tx.send(bytes.clone()).await.is_ok() {
                sent += 1;
            } else {
                tracing::debug!(peer_id = %peer, "skipping closed connection");
            }
        }
        tracing::debug!(kind = envelope.payload.type_name(), sent, "broadcast");
        sent
    }

    /// Whether a link to `peer` is open.
    pub fn is_peer_connected(&self, peer: &PeerId) -> bool {
        self.inner.is_open(peer)
    }

    /// Whether the connection to `peer` completed a full sync.
    pub fn is_synced(&self, peer: &PeerId) -> bool {
        self.inner
            .connections
            .lock()
            .get(peer)
            .is_some_and(|c| c.synced)
    }

    /// State of the connection to `peer`.
    pub fn connection_state(&self, peer: &PeerId) -> ConnectionState {
        if self.inner.is_open(peer) {
            ConnectionState::Open
        } else if self.inner.dialing.lock().contains(peer) {
            ConnectionState::Opening
        } else {
            ConnectionState::Closed
        }
    }

    /// Peers with an open link, sorted.
    pub fn open_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.inner.connections.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Current aggregate status.
    pub fn status(&self) -> SyncStatus {
        *self.inner.status.borrow()
    }

    /// Watch channel following the aggregate status.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// The local identity.
    pub fn identity(&self) -> &Arc<Identity> {
        &self.inner.identity
    }

    /// The reconnect scheduler serving this manager.
    pub fn scheduler(&self) -> &ReconnectScheduler {
        &self.inner.scheduler
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Runs one health check immediately.
    pub fn check_health(&self) {
        self.inner.check_health();
    }

    /// Stops background work and drops every link. Wanted peers are kept so
    /// the next start can resume them.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let drained: Vec<Connection> = self.inner.connections.lock().drain().map(|(_, c)| c).collect();
        for conn in drained {
            conn.reader.abort();
        }
        self.inner.refresh_status();
    }
}
