//! Composition root of one peer.
//!
//! [`SyncEngine::init`] wires a store, a transport, the local identity, and
//! an optional REST mirror into a running peer: the [`TaskBook`] for local
//! mutations, a [`ConnectionManager`] serving a [`SyncHandler`], and a pump
//! that broadcasts every published mutation. [`SyncEngine::shutdown`] tears
//! it all down again.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use weektodo_proto::merge::MergeOutcome;
use weektodo_proto::message::Envelope;

use crate::peer::manager::ManagerOptions;
use crate::peer::{ConnectionManager, Identity, PeerError, SyncStatus};
use crate::rest::{RestClient, RestError};
use crate::store::{StoreError, TaskStore};
use crate::sync::{Outbox, SyncHandler, TaskBook};
use crate::transport::{PeerId, Transport};

/// Errors surfaced by engine-level operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Local storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Connection management failed.
    #[error(transparent)]
    Peer(#[from] PeerError),

    /// The REST mirror failed.
    #[error(transparent)]
    Rest(RestError),

    /// A REST mirror is configured but this peer never registered with it.
    #[error("not logged in to the REST mirror")]
    NotLoggedIn,

    /// `sync()` found no open connection and no mirror to fall back on.
    #[error("no peer connections available")]
    NoPeerConnection,
}

impl From<RestError> for SyncError {
    fn from(e: RestError) -> Self {
        match e {
            RestError::NotLoggedIn => Self::NotLoggedIn,
            other => Self::Rest(other),
        }
    }
}

/// How an explicit [`SyncEngine::sync`] was carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRoute {
    /// A sync request went out on this many open connections.
    Peers(usize),
    /// The collection was merged through the REST mirror.
    Mirror(MergeOutcome),
}

/// A running peer.
pub struct SyncEngine<S, T> {
    book: Arc<TaskBook<S>>,
    identity: Arc<Identity>,
    manager: ConnectionManager<T, SyncHandler<S>>,
    rest: Option<RestClient>,
    shutdown: CancellationToken,
    pump: JoinHandle<()>,
}

impl<S: TaskStore + 'static, T: Transport> SyncEngine<S, T> {
    /// Opens the book, persists the identity, starts the connection manager
    /// and the broadcast pump, and registers with the REST mirror if one is
    /// given. A failed registration is logged; `sync()` then reports
    /// [`SyncError::NotLoggedIn`].
    ///
    /// # Errors
    ///
    /// [`SyncError::Store`] if the store cannot be read,
    /// [`SyncError::Peer`] if the identity cannot be saved.
    pub async fn init(
        store: S,
        transport: T,
        identity: Identity,
        rest: Option<RestClient>,
        options: ManagerOptions,
    ) -> Result<Self, SyncError> {
        let (book, outbox) = TaskBook::open(store).await?;
        let book = Arc::new(book);
        let identity = Arc::new(identity);
        identity.ensure_persisted().await?;

        let shutdown = CancellationToken::new();
        let manager = ConnectionManager::new(
            transport,
            SyncHandler::new(Arc::clone(&book), Arc::clone(&identity)),
            Arc::clone(&identity),
            options,
            shutdown.child_token(),
        );
        manager.start();
        let pump = tokio::spawn(pump_outbox(
            outbox,
            manager.clone(),
            Arc::clone(&identity),
            shutdown.clone(),
        ));

        if let Some(client) = &rest {
            if let Err(e) = client.register(&identity.state()).await {
                tracing::warn!(url = client.base_url(), err = %e, "REST mirror registration failed");
            }
        }

        tracing::info!(peer_id = %identity.peer_id(), "sync engine started");
        Ok(Self {
            book,
            identity,
            manager,
            rest,
            shutdown,
            pump,
        })
    }

    /// The local mutation API.
    pub fn book(&self) -> &Arc<TaskBook<S>> {
        &self.book
    }

    /// The connection manager.
    pub const fn manager(&self) -> &ConnectionManager<T, SyncHandler<S>> {
        &self.manager
    }

    /// The local identity.
    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    /// The REST mirror client, if configured.
    pub const fn rest(&self) -> Option<&RestClient> {
        self.rest.as_ref()
    }

    /// This peer's id.
    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Aggregate connectivity.
    pub fn sync_status(&self) -> SyncStatus {
        self.manager.status()
    }

    /// Whether a link to `peer` is open.
    pub fn is_peer_connected(&self, peer: &PeerId) -> bool {
        self.manager.is_peer_connected(peer)
    }

    /// Connects to `target` (see [`ConnectionManager::connect`]) and mirrors
    /// the relation to the REST mirror when registered.
    ///
    /// # Errors
    ///
    /// [`SyncError::Peer`] with the connection failure.
    pub async fn connect(&self, target: Option<&PeerId>) -> Result<PeerId, SyncError> {
        let connected = self.manager.connect(target).await?;
        if let (Some(target), Some(rest)) = (target, self.registered_mirror()) {
            let me = self.identity.peer_id();
            if let Err(e) = rest.connect(me.as_str(), target.as_str()).await {
                tracing::debug!(peer_id = %target, err = %e, "mirror did not record connection");
            }
        }
        Ok(connected)
    }

    /// Disconnects from `target`, or from everyone.
    pub async fn disconnect(&self, target: Option<&PeerId>) {
        self.manager.disconnect(target).await;
        if let (Some(target), Some(rest)) = (target, self.registered_mirror()) {
            let me = self.identity.peer_id();
            if let Err(e) = rest.disconnect(me.as_str(), target.as_str()).await {
                tracing::debug!(peer_id = %target, err = %e, "mirror did not record disconnect");
            }
        }
    }

    /// Dials every persisted peer. Failures are left to the reconnect
    /// scheduler. Returns how many links came up.
    pub async fn resume(&self) -> usize {
        let mut up = 0;
        for peer in self.identity.connected_peers() {
            match self.manager.connect(Some(&peer)).await {
                Ok(_) => up += 1,
                Err(e) => tracing::info!(peer_id = %peer, err = %e, "persisted peer not reachable yet"),
            }
        }
        up
    }

    /// Requests a full sync.
    ///
    /// With open connections, a sync request goes out on each of them and
    /// the responses are merged as they arrive. Without any, the collection
    /// is pushed to the REST mirror and the merged result applied locally.
    ///
    /// # Errors
    ///
    /// - [`SyncError::NotLoggedIn`] if a mirror is configured but this peer
    ///   is not registered with it.
    /// - [`SyncError::NoPeerConnection`] if there is neither a connection nor
    ///   a mirror.
    /// - Store or mirror failures.
    pub async fn sync(&self) -> Result<SyncRoute, SyncError> {
        let me = self.identity.peer_id();
        if !self.manager.open_peers().is_empty() {
            let sent = self
                .manager
                .broadcast(&Envelope::sync_request().from_peer(me.as_str()))
                .await;
            if sent > 0 {
                tracing::info!(sent, "sync requested from peers");
                return Ok(SyncRoute::Peers(sent));
            }
        }

        let Some(rest) = &self.rest else {
            return Err(SyncError::NoPeerConnection);
        };
        if !rest.is_registered() {
            return Err(SyncError::NotLoggedIn);
        }
        let local = self.book.all_todos().await?;
        let merged = rest.sync(me.as_str(), local).await?;
        let outcome = self.book.merge_remote(merged).await?;
        self.identity.mark_synced(Utc::now());
        self.identity.persist().await?;
        tracing::info!(
            replaced = outcome.replaced,
            inserted = outcome.inserted,
            "synced through REST mirror"
        );
        Ok(SyncRoute::Mirror(outcome))
    }

    /// Stops background work and saves the identity.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.manager.shutdown();
        self.pump.abort();
        if let Err(e) = self.identity.persist().await {
            tracing::warn!(err = %e, "could not persist identity on shutdown");
        }
        tracing::info!(peer_id = %self.identity.peer_id(), "sync engine stopped");
    }

    fn registered_mirror(&self) -> Option<&RestClient> {
        self.rest.as_ref().filter(|r| r.is_registered())
    }
}

impl<S, T> Drop for SyncEngine<S, T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.pump.abort();
    }
}

async fn pump_outbox<T: Transport, H: crate::peer::MessageHandler>(
    mut outbox: Outbox,
    manager: ConnectionManager<T, H>,
    identity: Arc<Identity>,
    shutdown: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            () = shutdown.cancelled() => break,
            env = outbox.recv() => env,
        };
        let Some(envelope) = envelope else { break };
        let envelope = envelope.from_peer(identity.peer_id().as_str());
        manager.broadcast(&envelope).await;
    }
    drain(&mut outbox);
}

fn drain(outbox: &mut mpsc::UnboundedReceiver<Envelope>) {
    let mut dropped = 0usize;
    while outbox.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        tracing::debug!(dropped, "unsent changes discarded on shutdown");
    }
}
