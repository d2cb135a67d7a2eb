//! Versioned wire envelope and protocol message types.
//!
//! Every unit of wire communication is one [`Envelope`] holding exactly one
//! [`WireMessage`]. Envelopes whose version is outside the supported set are
//! rejected before dispatch.
//!
//! Framing (length prefix, partial-read reassembly) lives in
//! [`super::framing`]; this module only defines the payload shapes.

use crate::Address;
use crate::data::{AddDataRequest, RemoveDataRequest};
use serde::{Deserialize, Serialize};

/// Current protocol version.
///
/// Increment when making breaking changes to the wire protocol.
pub const PROTOCOL_VERSION: u32 = 1;

/// Versions this node accepts on inbound envelopes.
pub const SUPPORTED_VERSIONS: [u32; 1] = [PROTOCOL_VERSION];

/// One versioned, length-framed unit of wire communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub payload: WireMessage,
}

impl Envelope {
    /// Wrap a message at the current protocol version.
    pub fn new(payload: WireMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    /// Check the version against the locally supported set.
    pub fn is_version_supported(&self) -> bool {
        SUPPORTED_VERSIONS.contains(&self.version)
    }
}

/// Reason carried by a graceful close announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseAnnouncement {
    /// Node is shutting down
    Shutdown,
    /// A duplicate connection to the same address exists
    DuplicateConnection,
    /// The peer violated the protocol
    ProtocolViolation,
    /// Address validation finished and the transient connection is done
    ValidationComplete,
}

/// Every message the overlay protocol speaks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// First envelope on every connection: announces the sender's listening
    /// address (None for non-listening peers). The claimed address of an
    /// inbound connection is what address validation later verifies.
    Hello { address: Option<Address> },

    /// Best-effort announcement sent before closing the socket.
    Close { reason: CloseAnnouncement },

    /// Keep-alive probe.
    Ping { nonce: u64 },
    /// Keep-alive reply, echoing the probe nonce.
    Pong { nonce: u64 },

    /// Peer exchange: sender's known-peer subset, asking for one back.
    PeersRequest { nonce: u64, peers: Vec<Address> },
    /// Peer exchange reply, correlated by nonce.
    PeersResponse { nonce: u64, peers: Vec<Address> },

    /// Address validation challenge, sent over a fresh outbound connection
    /// to the address an inbound peer claimed.
    ValidateAddress { nonce: u64 },
    /// Address validation reply: echoes the nonce and states the address
    /// the responder believes it is reachable at.
    AddressProof { nonce: u64, address: Address },

    /// Gossip fan-out wrapper; receivers unwrap and redispatch the inner
    /// message to local listeners exactly once per arrival.
    Broadcast { message: Box<WireMessage> },

    /// Distributed-data admission requests.
    AddData(AddDataRequest),
    RemoveData(RemoveDataRequest),
}

impl WireMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "Hello",
            Self::Close { .. } => "Close",
            Self::Ping { .. } => "Ping",
            Self::Pong { .. } => "Pong",
            Self::PeersRequest { .. } => "PeersRequest",
            Self::PeersResponse { .. } => "PeersResponse",
            Self::ValidateAddress { .. } => "ValidateAddress",
            Self::AddressProof { .. } => "AddressProof",
            Self::Broadcast { .. } => "Broadcast",
            Self::AddData(_) => "AddData",
            Self::RemoveData(_) => "RemoveData",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_uses_current_version() {
        let envelope = Envelope::new(WireMessage::Ping { nonce: 1 });
        assert_eq!(envelope.version, PROTOCOL_VERSION);
        assert!(envelope.is_version_supported());
    }

    #[test]
    fn test_unsupported_version_detected() {
        let mut envelope = Envelope::new(WireMessage::Ping { nonce: 1 });
        envelope.version = 99;
        assert!(!envelope.is_version_supported());
    }

    #[test]
    fn test_roundtrip() {
        let envelope = Envelope::new(WireMessage::PeersRequest {
            nonce: 42,
            peers: vec![Address::localhost(1000), Address::localhost(2000)],
        });
        let bytes = bincode::serialize(&envelope).unwrap();
        let parsed: Envelope = bincode::deserialize(&bytes).unwrap();
        assert_eq!(envelope, parsed);
    }

    #[test]
    fn test_broadcast_wrapper_roundtrip() {
        let inner = WireMessage::Ping { nonce: 7 };
        let envelope = Envelope::new(WireMessage::Broadcast {
            message: Box::new(inner.clone()),
        });
        let bytes = bincode::serialize(&envelope).unwrap();
        let parsed: Envelope = bincode::deserialize(&bytes).unwrap();
        match parsed.payload {
            WireMessage::Broadcast { message } => assert_eq!(*message, inner),
            other => panic!("expected Broadcast, got {}", other.kind()),
        }
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(WireMessage::Ping { nonce: 0 }.kind(), "Ping");
        assert_eq!(
            WireMessage::Hello { address: None }.kind(),
            "Hello"
        );
    }
}
