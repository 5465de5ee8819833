//! Type-specific payload envelopes carried inside [`crate::packet::Packet`].
//!
//! The packet header (§3) is a fixed-width binary layout; the payloads it
//! wraps are CBOR. Using a self-describing encoding here keeps the header
//! fixed-width while payload shapes can gain fields without a header
//! version bump.

use serde::{Deserialize, Serialize};

use crate::packet::Nid;

/// Carried in an AUTH_REQUEST or AUTH_RESPONSE packet's payload.
///
/// The two envelope kinds share a shape because the protocol (§4.5) is
/// symmetric after the first message: both the initiator's opening message
/// and the responder's reply carry a certificate, an ephemeral ECDH public
/// key, and a nonce; only the responder's reply additionally carries a
/// signature over the handshake transcript so far. The final initiator ->
/// responder leg carries only a signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuthEnvelope {
    /// Initiator -> Responder, first message: certificate, ephemeral public
    /// key, and challenge nonce `C1`.
    Open {
        certificate_der: Vec<u8>,
        ephemeral_public: Vec<u8>,
        nonce: [u8; 32],
    },
    /// Responder -> Initiator: certificate, ephemeral public key, nonce
    /// `C2`, and `sig_R = ECDSA(PrivK_R, C1 || ephPub_I || ephPub_R)`.
    Reply {
        certificate_der: Vec<u8>,
        ephemeral_public: Vec<u8>,
        nonce: [u8; 32],
        signature: Vec<u8>,
    },
    /// Initiator -> Responder, final message:
    /// `sig_I = ECDSA(PrivK_I, C2 || ephPub_R || ephPub_I)`.
    Finish { signature: Vec<u8> },
}

/// HEARTBEAT payload: `sink_nid || timestamp || signature`, per §4.6 and
/// SPEC_FULL.md §E.1 (raw `r || s` signature, fixed 132 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub sink_nid: Nid,
    pub timestamp_secs: u64,
    pub signature: [u8; crate::crypto::ECDSA_P521_RAW_SIG_LEN],
}

impl HeartbeatPayload {
    pub const LEN: usize = 16 + 8 + crate::crypto::ECDSA_P521_RAW_SIG_LEN;

    /// The byte string the Sink's ECDSA signature is computed over:
    /// `sink_nid || timestamp || sequence`. `sequence` comes from the
    /// enclosing packet header, not this payload.
    pub fn signed_message(sink_nid: Nid, timestamp_secs: u64, sequence: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + 8 + 4);
        buf.extend_from_slice(sink_nid.as_bytes());
        buf.extend_from_slice(&timestamp_secs.to_be_bytes());
        buf.extend_from_slice(&sequence.to_be_bytes());
        buf
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(self.sink_nid.as_bytes());
        buf.extend_from_slice(&self.timestamp_secs.to_be_bytes());
        buf.extend_from_slice(&self.signature);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::LEN {
            return None;
        }
        let mut sink_nid = [0u8; 16];
        sink_nid.copy_from_slice(&bytes[0..16]);
        let timestamp_secs = u64::from_be_bytes(bytes[16..24].try_into().ok()?);
        let mut signature = [0u8; crate::crypto::ECDSA_P521_RAW_SIG_LEN];
        signature.copy_from_slice(&bytes[24..Self::LEN]);
        Some(Self {
            sink_nid: Nid(sink_nid),
            timestamp_secs,
            signature,
        })
    }
}

/// DATA payload once end-to-end unwrapped is just opaque application
/// bytes; the AEAD envelope itself (`nonce || ciphertext || tag`) is the
/// on-wire payload, so no separate struct is needed for DATA.

/// A CONTROL packet's payload for operator-facing signalling that isn't
/// part of routing or authentication (block/unblock heartbeat simulation
/// is Sink-local per §4.10 and never goes over the wire). `MsgType::Control`
/// itself also carries the routed end-to-end key-agreement handshake
/// (see [`crate::e2e`]) for Node/Sink pairs that are not directly linked —
/// that traffic is `AuthEnvelope` CBOR, not this type, reusing the message
/// type rather than minting a new one for a second handshake instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlEnvelope {
    Ping,
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_payload_round_trips() {
        let p = HeartbeatPayload {
            sink_nid: Nid([0xbb; 16]),
            timestamp_secs: 1_700_000_000,
            signature: [0x42; crate::crypto::ECDSA_P521_RAW_SIG_LEN],
        };
        let bytes = p.encode();
        assert_eq!(bytes.len(), HeartbeatPayload::LEN);
        assert_eq!(HeartbeatPayload::decode(&bytes), Some(p));
    }

    #[test]
    fn heartbeat_payload_rejects_wrong_length() {
        assert_eq!(HeartbeatPayload::decode(&[0u8; 10]), None);
    }

    #[test]
    fn auth_envelope_round_trips_through_cbor() {
        let open = AuthEnvelope::Open {
            certificate_der: vec![1, 2, 3],
            ephemeral_public: vec![4, 5, 6],
            nonce: [9u8; 32],
        };
        let bytes = serde_cbor::to_vec(&open).unwrap();
        let decoded: AuthEnvelope = serde_cbor::from_slice(&bytes).unwrap();
        match decoded {
            AuthEnvelope::Open { certificate_der, .. } => assert_eq!(certificate_der, vec![1, 2, 3]),
            _ => panic!("wrong variant"),
        }
    }
}
