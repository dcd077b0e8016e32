//! Frames exchanged between peers and the link broker.
//!
//! Peers that cannot reach each other directly hold a WebSocket to the
//! broker. After registering a peerId, a peer opens a virtual link to another
//! registered peer; the broker forwards `Open`, `Accept`, `Data` and `Close`
//! frames by `to` and never looks inside `Data` payloads. Frames are
//! postcard-encoded in WebSocket binary messages.

use serde::{Deserialize, Serialize};

/// Messages exchanged between broker clients and the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMessage {
    /// Claims a peerId on this socket. Must be the first frame sent.
    Register {
        /// PeerId being claimed.
        peer_id: String,
    },

    /// Broker confirms the registration.
    Registered {
        /// PeerId that was registered (echoed back).
        peer_id: String,
    },

    /// Asks `to` to accept a link from `from`.
    Open {
        /// Dialing peer (the broker overwrites it with the registered id).
        from: String,
        /// Peer being dialed.
        to: String,
    },

    /// The dialed peer accepted the link.
    Accept {
        /// Accepting peer (overwritten by the broker).
        from: String,
        /// The original dialer.
        to: String,
    },

    /// One sync frame travelling over an established link.
    Data {
        /// Sending peer (overwritten by the broker).
        from: String,
        /// Receiving peer.
        to: String,
        /// Opaque encoded envelope.
        payload: Vec<u8>,
    },

    /// One side tore the link down.
    Close {
        /// Closing peer (overwritten by the broker).
        from: String,
        /// Other end of the link.
        to: String,
    },

    /// The broker has no registration for `to`.
    Unavailable {
        /// PeerId that could not be reached.
        to: String,
    },

    /// Broker reports an error condition.
    Error {
        /// Human-readable error description.
        reason: String,
    },
}

impl RelayMessage {
    /// Returns the frame with its `from` field replaced, if it has one.
    #[must_use]
    pub fn with_sender(self, sender: &str) -> Self {
        let from = sender.to_string();
        match self {
            Self::Open { to, .. } => Self::Open { from, to },
            Self::Accept { to, .. } => Self::Accept { from, to },
            Self::Data { to, payload, .. } => Self::Data { from, to, payload },
            Self::Close { to, .. } => Self::Close { from, to },
            other => other,
        }
    }

    /// Routing target for peer-to-peer frames.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Open { to, .. }
            | Self::Accept { to, .. }
            | Self::Data { to, .. }
            | Self::Close { to, .. } => Some(to),
            _ => None,
        }
    }
}

/// Encodes a [`RelayMessage`] into bytes using postcard.
pub fn encode(msg: &RelayMessage) -> Result<Vec<u8>, String> {
    postcard::to_allocvec(msg).map_err(|e| format!("relay encode error: {e}"))
}

/// Decodes a [`RelayMessage`] from bytes using postcard.
pub fn decode(bytes: &[u8]) -> Result<RelayMessage, String> {
    postcard::from_bytes(bytes).map_err(|e| format!("relay decode error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_survives_encoding() {
        let msg = RelayMessage::Data {
            from: "sender-1".to_string(),
            to: "recipient-2".to_string(),
            payload: br#"{"type":"SYNC_REQUEST"}"#.to_vec(),
        };
        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn with_sender_overwrites_spoofed_from() {
        let msg = RelayMessage::Open {
            from: "mallory".into(),
            to: "bob".into(),
        };
        assert_eq!(
            msg.with_sender("alice"),
            RelayMessage::Open {
                from: "alice".into(),
                to: "bob".into()
            }
        );
    }

    #[test]
    fn with_sender_leaves_control_frames_alone() {
        let msg = RelayMessage::Unavailable { to: "bob".into() };
        assert_eq!(msg.clone().with_sender("alice"), msg);
    }

    #[test]
    fn target_is_reported_for_link_frames_only() {
        let close = RelayMessage::Close {
            from: "a".into(),
            to: "b".into(),
        };
        assert_eq!(close.target(), Some("b"));
        let reg = RelayMessage::Register {
            peer_id: "a".into(),
        };
        assert_eq!(reg.target(), None);
    }

    #[test]
    fn decode_corrupted_bytes_fails() {
        assert!(decode(&[0xFF, 0xFE, 0xFD, 0xFC]).is_err());
        assert!(decode(&[]).is_err());
    }
}
