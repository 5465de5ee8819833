//! The abstract link-transport contract (§4.4) consumed from the BLE
//! collaborator. Only this trait is part of the core; any concrete BLE
//! adapter lives outside this crate. Broadens a single-peer
//! `send`/`recv` transport into the per-port send/broadcast/scan/connect
//! surface the tree topology needs.

use async_trait::async_trait;
use thiserror::Error;

/// Opaque discriminator for one link: either the well-known uplink slot or
/// a specific downlink peer, identified by its BLE address string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PortId {
    Uplink,
    Downlink(String),
}

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortId::Uplink => write!(f, "uplink"),
            PortId::Downlink(addr) => write!(f, "{addr}"),
        }
    }
}

/// Errors surfaced by a [`LinkTransport`] implementation. Per §7 these
/// propagate to the link manager, which reclassifies them as uplink or
/// downlink loss rather than unwinding through the router.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("write failed on port {0}")]
    WriteFailed(String),
    #[error("peer on port {0} disconnected")]
    Disconnected(String),
    #[error("transport error: {0}")]
    Unknown(String),
}

/// A discovered neighbour, as returned by [`LinkTransport::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbour {
    pub address: String,
    /// Advertised hop count: -1 Sink, 0..254 Node, 254 peripheral-only.
    pub advertised_hop: i16,
    pub device_type: DeviceType,
    pub rssi: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Sink,
    Node,
    PeripheralOnly,
}

/// Sentinel hop-count values from the glossary.
pub const HOP_PERIPHERAL_ONLY: i16 = 254;
pub const HOP_NO_UPLINK: i16 = 255;
pub const HOP_SINK: i16 = -1;

/// Contract the BLE collaborator implements and the router/link-manager
/// consume. Concrete implementations fragment frames above the BLE MTU
/// (180 bytes) and reassemble them before invoking the subscribed
/// callback; that fragmentation is invisible here (§4.4).
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Unicasts `bytes` to the peer on `port`.
    async fn send(&self, port: &PortId, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Delivers `bytes` to every currently-subscribed peer except those in
    /// `exclude`. Used for heartbeat floods and the "stop heartbeat" debug
    /// feature (exclusion by peer NID is translated by the caller into a
    /// port-set before this call).
    async fn broadcast(&self, bytes: Vec<u8>, exclude: &[PortId]) -> Result<(), TransportError>;

    /// Passive neighbour discovery, bounded by `timeout`.
    async fn scan(&self, timeout: std::time::Duration) -> Result<Vec<Neighbour>, TransportError>;

    /// Initiates a connection to `address`, returning the port identifier
    /// it is subsequently addressed by.
    async fn connect(&self, address: &str) -> Result<PortId, TransportError>;

    /// Tears down the link on `port`.
    async fn disconnect(&self, port: &PortId) -> Result<(), TransportError>;

    /// Refreshes the advertised hop count after a recomputation.
    async fn update_advertisement(&self, hop_count: i16) -> Result<(), TransportError>;
}

/// Callback signature for inbound frame delivery, installed once per port
/// by whoever owns the transport (the router daemon, in practice).
pub type InboundCallback = std::sync::Arc<dyn Fn(PortId, Vec<u8>) + Send + Sync>;
