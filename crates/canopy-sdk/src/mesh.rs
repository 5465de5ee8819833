//! In-memory link transport, used by tests and by the bundled demo in
//! place of a real BLE adapter. Several devices share one [`LoopbackHub`],
//! which relays `send`/`broadcast` calls between the [`LoopbackTransport`]
//! each device owns, modeling the multi-party mesh this crate actually
//! routes over rather than a single point-to-point pair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use canopy_protocol::transport::{DeviceType, InboundCallback, LinkTransport, Neighbour, PortId, TransportError};
use parking_lot::RwLock;
use rand::Rng;

#[derive(Clone)]
struct LinkInfo {
    remote_address: String,
    remote_port: PortId,
}

/// The shared relay. Devices register themselves on construction and stay
/// reachable for the hub's lifetime; nothing here models physical radio
/// range, only the logical send/broadcast/scan surface §4.4 specifies.
#[derive(Default)]
pub struct LoopbackHub {
    peers: RwLock<HashMap<String, Weak<LoopbackTransport>>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, transport: &Arc<LoopbackTransport>) {
        self.peers
            .write()
            .insert(transport.address.clone(), Arc::downgrade(transport));
    }

    fn lookup(&self, address: &str) -> Option<Arc<LoopbackTransport>> {
        self.peers.read().get(address).and_then(Weak::upgrade)
    }

    fn neighbours_of(&self, caller_address: &str) -> Vec<Neighbour> {
        self.peers
            .read()
            .iter()
            .filter(|(addr, _)| addr.as_str() != caller_address)
            .filter_map(|(addr, weak)| {
                let peer = weak.upgrade()?;
                Some(Neighbour {
                    address: addr.clone(),
                    advertised_hop: peer.advertised_hop.load(Ordering::Relaxed),
                    device_type: peer.device_type,
                    rssi: rand::thread_rng().gen_range(-80..=-30),
                })
            })
            .collect()
    }
}

/// One device's handle onto the shared hub.
pub struct LoopbackTransport {
    address: String,
    hub: Arc<LoopbackHub>,
    device_type: DeviceType,
    advertised_hop: AtomicI16,
    links: RwLock<HashMap<PortId, LinkInfo>>,
    inbound_handler: RwLock<Option<InboundCallback>>,
    connection_handler: RwLock<Option<Arc<dyn Fn(PortId) + Send + Sync>>>,
}

impl LoopbackTransport {
    pub fn new(address: impl Into<String>, device_type: DeviceType, hub: Arc<LoopbackHub>) -> Arc<Self> {
        // The Sink's hop count never changes (glossary: Sink = -1), so it
        // cannot rely on `update_advertisement` being called after a
        // handshake the way a Node's does; seed it correctly up front so
        // neighbour scans don't see a freshly-constructed Sink as
        // "no uplink" (255, excluded from ranking by `LinkManager::rank_candidates`).
        let initial_hop = match device_type {
            DeviceType::Sink => canopy_protocol::transport::HOP_SINK,
            DeviceType::Node | DeviceType::PeripheralOnly => canopy_protocol::transport::HOP_NO_UPLINK,
        };
        let transport = Arc::new(Self {
            address: address.into(),
            hub: hub.clone(),
            device_type,
            advertised_hop: AtomicI16::new(initial_hop),
            links: RwLock::new(HashMap::new()),
            inbound_handler: RwLock::new(None),
            connection_handler: RwLock::new(None),
        });
        hub.register(&transport);
        transport
    }

    /// Installs the callback the composition root's dispatcher runs for
    /// every inbound frame (CBOR/packet bytes plus the port it arrived on).
    pub fn set_inbound_handler(&self, handler: InboundCallback) {
        *self.inbound_handler.write() = Some(handler);
    }

    /// Installs the callback invoked when another device dials into us
    /// (we become its uplink). The composition root uses this to kick off
    /// `LinkManager::accept_downlink`.
    pub fn set_connection_handler(&self, handler: Arc<dyn Fn(PortId) + Send + Sync>) {
        *self.connection_handler.write() = Some(handler);
    }

    fn accept_connection(self: &Arc<Self>, from_address: String) -> PortId {
        let port = PortId::Downlink(from_address.clone());
        self.links.write().insert(
            port.clone(),
            LinkInfo {
                remote_address: from_address,
                remote_port: PortId::Uplink,
            },
        );
        if let Some(handler) = self.connection_handler.read().clone() {
            handler(port.clone());
        }
        port
    }

    fn deliver(&self, port: PortId, bytes: Vec<u8>) {
        if let Some(handler) = self.inbound_handler.read().clone() {
            handler(port, bytes);
        }
    }
}

#[async_trait]
impl LinkTransport for LoopbackTransport {
    async fn send(&self, port: &PortId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let info = self
            .links
            .read()
            .get(port)
            .cloned()
            .ok_or_else(|| TransportError::Disconnected(port.to_string()))?;
        let peer = self
            .hub
            .lookup(&info.remote_address)
            .ok_or_else(|| TransportError::Disconnected(info.remote_address.clone()))?;
        peer.deliver(info.remote_port, bytes);
        Ok(())
    }

    async fn broadcast(&self, bytes: Vec<u8>, exclude: &[PortId]) -> Result<(), TransportError> {
        let links: Vec<LinkInfo> = self
            .links
            .read()
            .iter()
            .filter(|(port, _)| !exclude.contains(port))
            .map(|(_, info)| info.clone())
            .collect();
        for info in links {
            if let Some(peer) = self.hub.lookup(&info.remote_address) {
                peer.deliver(info.remote_port, bytes.clone());
            }
        }
        Ok(())
    }

    async fn scan(&self, _timeout: std::time::Duration) -> Result<Vec<Neighbour>, TransportError> {
        Ok(self.hub.neighbours_of(&self.address))
    }

    async fn connect(&self, address: &str) -> Result<PortId, TransportError> {
        let peer = self
            .hub
            .lookup(address)
            .ok_or_else(|| TransportError::Unknown(format!("no such peer: {address}")))?;
        let remote_port = peer.accept_connection(self.address.clone());
        let local_port = PortId::Uplink;
        self.links.write().insert(
            local_port.clone(),
            LinkInfo {
                remote_address: address.to_string(),
                remote_port,
            },
        );
        Ok(local_port)
    }

    async fn disconnect(&self, port: &PortId) -> Result<(), TransportError> {
        self.links.write().remove(port);
        Ok(())
    }

    async fn update_advertisement(&self, hop_count: i16) -> Result<(), TransportError> {
        self.advertised_hop.store(hop_count, Ordering::Relaxed);
        Ok(())
    }
}
