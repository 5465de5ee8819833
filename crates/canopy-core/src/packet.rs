//! Fixed 70-byte packet header plus variable payload, and the canonical
//! byte range the per-link MAC is computed over.

use thiserror::Error;
use uuid::Uuid;

/// Width of the fixed header, including the 32-byte MAC field.
pub const HEADER_LEN: usize = 16 + 16 + 1 + 1 + 4 + 32;

/// Upper bound on payload size; frames above this never reach the wire.
/// The BLE adapter fragments at 180 bytes per spec.md §4.4, but that
/// fragmentation is internal to the transport and invisible here.
pub const PAYLOAD_MAX: usize = 4096;

/// 128-bit network identifier, canonically a UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nid(pub [u8; 16]);

impl Nid {
    /// The distinguished NID used only as a HEARTBEAT destination.
    pub const BROADCAST: Nid = Nid([0xFF; 16]);

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Nid(*id.as_bytes())
    }

    pub fn to_uuid(self) -> Uuid {
        Uuid::from_bytes(self.0)
    }
}

impl std::fmt::Display for Nid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_uuid())
    }
}

impl From<Uuid> for Nid {
    fn from(id: Uuid) -> Self {
        Nid::from_uuid(id)
    }
}

/// Closed sum type for the wire-level message kind, replacing the
/// dynamic-dispatch-by-string pattern the source material used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Data = 0x01,
    Heartbeat = 0x02,
    Control = 0x03,
    AuthRequest = 0x04,
    AuthResponse = 0x05,
}

impl MsgType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(MsgType::Data),
            0x02 => Some(MsgType::Heartbeat),
            0x03 => Some(MsgType::Control),
            0x04 => Some(MsgType::AuthRequest),
            0x05 => Some(MsgType::AuthResponse),
            _ => None,
        }
    }
}

/// Errors returned by [`decode`] or [`encode`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("header truncated: need {HEADER_LEN} bytes, got {0}")]
    TruncatedHeader(usize),
    #[error("unknown msg_type byte {0:#04x}")]
    UnknownMsgType(u8),
    #[error("payload of {0} bytes exceeds PAYLOAD_MAX ({PAYLOAD_MAX})")]
    PayloadTooLarge(usize),
}

/// A fully-parsed packet. `mac` is opaque to this module beyond its width;
/// verification happens in `crypto`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub source: Nid,
    pub destination: Nid,
    pub msg_type: MsgType,
    pub ttl: u8,
    pub sequence: u32,
    pub mac: [u8; 32],
    pub payload: Vec<u8>,
}

impl Packet {
    /// Builds a packet with a zeroed MAC; callers compute and set the real
    /// MAC afterward via [`Packet::mac_input`] and a keyed MAC function.
    pub fn new(
        source: Nid,
        destination: Nid,
        msg_type: MsgType,
        ttl: u8,
        sequence: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            source,
            destination,
            msg_type,
            ttl,
            sequence,
            mac: [0u8; 32],
            payload,
        }
    }

    /// Returns the canonical byte range the MAC is computed over: every
    /// header field except the MAC itself, followed by the payload.
    pub fn mac_input(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + 16 + 1 + 1 + 4 + self.payload.len());
        buf.extend_from_slice(&self.source.0);
        buf.extend_from_slice(&self.destination.0);
        buf.push(self.msg_type as u8);
        buf.push(self.ttl);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Serializes the packet to its wire form.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.payload.len() > PAYLOAD_MAX {
            return Err(CodecError::PayloadTooLarge(self.payload.len()));
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.source.0);
        buf.extend_from_slice(&self.destination.0);
        buf.push(self.msg_type as u8);
        buf.push(self.ttl);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.mac);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parses a packet from its wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::TruncatedHeader(bytes.len()));
        }
        let mut source = [0u8; 16];
        source.copy_from_slice(&bytes[0..16]);
        let mut destination = [0u8; 16];
        destination.copy_from_slice(&bytes[16..32]);
        let msg_type = MsgType::from_byte(bytes[32]).ok_or(CodecError::UnknownMsgType(bytes[32]))?;
        let ttl = bytes[33];
        let sequence = u32::from_be_bytes(bytes[34..38].try_into().unwrap());
        let mut mac = [0u8; 32];
        mac.copy_from_slice(&bytes[38..70]);
        let payload = bytes[HEADER_LEN..].to_vec();
        if payload.len() > PAYLOAD_MAX {
            return Err(CodecError::PayloadTooLarge(payload.len()));
        }
        Ok(Packet {
            source: Nid(source),
            destination: Nid(destination),
            msg_type,
            ttl,
            sequence,
            mac,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nid(byte: u8) -> Nid {
        Nid([byte; 16])
    }

    #[test]
    fn encode_decode_round_trip_preserves_fields() {
        let mut p = Packet::new(nid(0xaa), nid(0xbb), MsgType::Data, 7, 42, b"hello".to_vec());
        p.mac = [0x77; 32];
        let bytes = p.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 5);
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn mac_input_excludes_mac_field() {
        let mut p = Packet::new(nid(0xaa), nid(0xbb), MsgType::Data, 7, 42, b"hello".to_vec());
        p.mac = [0x11; 32];
        let input_a = p.mac_input();
        p.mac = [0x22; 32];
        let input_b = p.mac_input();
        assert_eq!(input_a, input_b);
    }

    #[test]
    fn truncated_header_is_rejected() {
        let err = Packet::decode(&[0u8; 10]).unwrap_err();
        assert_eq!(err, CodecError::TruncatedHeader(10));
    }

    #[test]
    fn unknown_msg_type_is_rejected() {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[32] = 0x09;
        let err = Packet::decode(&bytes).unwrap_err();
        assert_eq!(err, CodecError::UnknownMsgType(0x09));
    }

    #[test]
    fn payload_too_large_is_rejected_on_encode() {
        let p = Packet::new(nid(1), nid(2), MsgType::Data, 1, 0, vec![0u8; PAYLOAD_MAX + 1]);
        assert_eq!(p.encode().unwrap_err(), CodecError::PayloadTooLarge(PAYLOAD_MAX + 1));
    }

    #[test]
    fn ttl_zero_is_representable_but_forwarding_is_a_router_concern() {
        let p = Packet::new(nid(1), nid(2), MsgType::Data, 0, 0, vec![]);
        let bytes = p.encode().unwrap();
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded.ttl, 0);
    }
}
