//! Transport layer abstraction for `WeekTodo` peer links.
//!
//! A transport hands out [`Link`]s: bidirectional, ordered byte channels to
//! one remote peer. Concrete implementations:
//! - [`loopback::LoopbackNetwork`] — in-process hub for tests and demos
//! - [`relay::RelayTransport`] — links brokered over a WebSocket relay

pub mod loopback;
pub mod relay;

use std::fmt;
use std::future::Future;

use tokio::sync::mpsc;

/// Unique identifier for a peer in the mesh.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(String);

impl PeerId {
    /// Create a new peer identifier from a string representation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the string representation of this peer ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Describes which kind of transport is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Links brokered by a relay server over WebSocket.
    Relay,
    /// In-process loopback.
    Loopback,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relay => write!(f, "Relay"),
            Self::Loopback => write!(f, "Loopback"),
        }
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The link or the transport itself has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The specified peer is not reachable via this transport.
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),

    /// The remote side or the broker refused the operation.
    #[error("rejected: {0}")]
    Rejected(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An open, ordered, bidirectional byte channel to one remote peer.
///
/// Dropping `outbound` closes the link; the remote side then sees its
/// `inbound` end. `inbound` yields `None` once the remote side closed.
#[derive(Debug)]
pub struct Link {
    /// The peer on the other end.
    pub remote: PeerId,
    /// Frames to send.
    pub outbound: mpsc::Sender<Vec<u8>>,
    /// Frames received, in arrival order.
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

/// Async transport that opens and accepts peer links.
///
/// Implementations carry opaque frames; they never inspect payloads.
pub trait Transport: Send + Sync + 'static {
    /// Opens a link to `peer`.
    ///
    /// May wait indefinitely for an unresponsive peer; callers bound the
    /// handshake with their own timeout.
    fn open(&self, peer: &PeerId) -> impl Future<Output = Result<Link, TransportError>> + Send;

    /// Waits for the next link opened by a remote peer.
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the transport can no
    /// longer accept links.
    fn accept(&self) -> impl Future<Output = Result<Link, TransportError>> + Send;

    /// Whether the transport currently has network connectivity.
    fn is_online(&self) -> bool;

    /// Return the type of this transport.
    fn transport_type(&self) -> TransportType;
}
