//! Peer identity, connection management, and reconnection.
//!
//! [`manager::ConnectionManager`] owns every live connection. Each connection
//! gets its own reader task that feeds inbound frames, in arrival order, to a
//! [`MessageHandler`]. Lost connections are handed to the
//! [`reconnect::ReconnectScheduler`], which retries them with a linear
//! backoff and gives up after a fixed number of attempts.

pub mod identity;
pub mod manager;
pub mod reconnect;

use std::fmt;
use std::future::Future;

use weektodo_proto::message::Envelope;

use crate::transport::{PeerId, TransportError};

pub use identity::{Identity, PeerState};
pub use manager::{ConnectionManager, ConnectionState};
pub use reconnect::{ReconnectPolicy, ReconnectScheduler};

/// Errors surfaced by connection management.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// The handshake with the peer took longer than the connect timeout.
    #[error("connection to {0} timed out")]
    ConnectionTimeout(PeerId),

    /// The transport refused or failed to open the link.
    #[error("connection to {peer} failed: {source}")]
    ConnectionError {
        /// Peer being dialed.
        peer: PeerId,
        /// Underlying transport failure.
        #[source]
        source: TransportError,
    },

    /// An operation needs at least one open connection and there is none.
    #[error("no peer connections available")]
    NoPeerConnection,

    /// The local identity could not be loaded or saved.
    #[error("peer identity error: {0}")]
    Identity(String),
}

/// Aggregate connectivity of this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No live connection and no dial in flight.
    Disconnected,
    /// A dial is in flight and nothing is connected yet.
    Connecting,
    /// At least one connection is open.
    Connected,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Outcome of handling one inbound frame.
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Envelope to send back on the same connection.
    pub reply: Option<Envelope>,
    /// The frame completed a full sync with the peer.
    pub synced: bool,
}

impl Dispatch {
    /// Answer on the same connection.
    #[must_use]
    pub const fn reply(envelope: Envelope) -> Self {
        Self {
            reply: Some(envelope),
            synced: false,
        }
    }

    /// A full collection was received and applied.
    #[must_use]
    pub const fn synced() -> Self {
        Self {
            reply: None,
            synced: true,
        }
    }
}

/// Consumer of frames arriving on peer connections.
///
/// Called from each connection's reader task; calls for one connection never
/// overlap, calls for different connections may.
pub trait MessageHandler: Send + Sync + 'static {
    /// Envelope to send first on every newly opened connection.
    fn on_open(&self, peer: &PeerId) -> Option<Envelope>;

    /// Handles one inbound frame.
    fn on_message(&self, peer: &PeerId, frame: &[u8]) -> impl Future<Output = Dispatch> + Send;
}
