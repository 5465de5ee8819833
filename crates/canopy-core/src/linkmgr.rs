//! Link manager (§4.9): maintains exactly one uplink and a set of
//! downlinks, drives authentication on every newly connected port,
//! stores per-port session keys (via the router daemon), and cascades
//! disconnect on uplink loss. Lazy uplink selection means a functioning
//! uplink is never abandoned for a better-looking neighbour; only loss
//! of the current uplink triggers reselection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::crypto::identity::NodeCredentials;
use crate::handshake::{client::run_initiator, server::run_responder, AuthChannel, AuthError, HandshakeOutcome};
use crate::messages::AuthEnvelope;
use crate::packet::{MsgType, Nid, Packet};
use crate::router::RouterDaemon;
use crate::transport::{
    DeviceType, LinkTransport, Neighbour, PortId, TransportError, HOP_NO_UPLINK, HOP_PERIPHERAL_ONLY,
};

#[derive(Debug, Error, Clone)]
pub enum LinkError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("no viable uplink candidate found")]
    NoUplinkCandidate,
}

/// One established link's bookkeeping, per spec.md §3's
/// "Link-Manager state" (the session key itself lives in the router's
/// per-port map, not duplicated here).
#[derive(Debug, Clone)]
pub struct LinkRecord {
    pub peer_nid: Nid,
    pub port: PortId,
    pub authenticated: bool,
    /// Meaningful for the uplink only; downlinks carry the sentinel 0.
    pub hop_count: i16,
}

/// Candidates that recently failed authentication or connection are held
/// back from reselection for this long, so a flaky neighbour doesn't
/// dominate every scan cycle.
const COOLDOWN: Duration = Duration::from_secs(30);

/// Feeds AUTH_REQUEST/AUTH_RESPONSE payloads from the transport's inbound
/// callback to whichever [`ControlChannel`] is waiting on that port. The
/// composition root's dispatcher calls [`LinkManager::handle_inbound_control`]
/// for those two message types; everything else goes to the router.
pub struct ControlChannel {
    transport: Arc<dyn LinkTransport>,
    port: PortId,
    self_nid: Nid,
    sequence: std::sync::atomic::AtomicU32,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl AuthChannel for ControlChannel {
    async fn send(&mut self, envelope: AuthEnvelope) -> Result<(), AuthError> {
        let msg_type = match envelope {
            AuthEnvelope::Reply { .. } => MsgType::AuthResponse,
            AuthEnvelope::Open { .. } | AuthEnvelope::Finish { .. } => MsgType::AuthRequest,
        };
        let payload = serde_cbor::to_vec(&envelope).map_err(|e| AuthError::Channel(e.to_string()))?;
        let sequence = self.sequence.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        // Pre-session: no link key exists yet to MAC this frame under.
        // Authenticity for the handshake comes entirely from the ECDSA
        // signatures embedded in the envelope, not this header's MAC
        // (see DESIGN.md for the resolved ambiguity).
        let mut packet = Packet::new(self.self_nid, Nid([0u8; 16]), msg_type, 1, sequence, payload);
        packet.mac = [0u8; 32];
        let bytes = packet.encode().map_err(|e| AuthError::Channel(e.to_string()))?;
        self.transport
            .send(&self.port, bytes)
            .await
            .map_err(|e| AuthError::Channel(e.to_string()))
    }

    async fn recv(&mut self) -> Result<AuthEnvelope, AuthError> {
        let raw = self
            .rx
            .recv()
            .await
            .ok_or_else(|| AuthError::Channel("control channel closed".into()))?;
        let packet = Packet::decode(&raw).map_err(|e| AuthError::Channel(e.to_string()))?;
        serde_cbor::from_slice(&packet.payload).map_err(|e| AuthError::Channel(e.to_string()))
    }
}

/// Owns the uplink slot and the downlink set for one device.
pub struct LinkManager {
    self_nid: Nid,
    is_sink: bool,
    config: Arc<Config>,
    transport: Arc<dyn LinkTransport>,
    router: Arc<RouterDaemon>,
    credentials: Arc<NodeCredentials>,
    ca_der: Vec<u8>,
    uplink: RwLock<Option<LinkRecord>>,
    downlinks: RwLock<HashMap<PortId, LinkRecord>>,
    cooldown: RwLock<HashMap<String, Instant>>,
    pending_channels: RwLock<HashMap<PortId, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl LinkManager {
    pub fn new(
        self_nid: Nid,
        is_sink: bool,
        config: Arc<Config>,
        transport: Arc<dyn LinkTransport>,
        router: Arc<RouterDaemon>,
        credentials: Arc<NodeCredentials>,
        ca_der: Vec<u8>,
    ) -> Self {
        Self {
            self_nid,
            is_sink,
            config,
            transport,
            router,
            credentials,
            ca_der,
            uplink: RwLock::new(None),
            downlinks: RwLock::new(HashMap::new()),
            cooldown: RwLock::new(HashMap::new()),
            pending_channels: RwLock::new(HashMap::new()),
        }
    }

    /// Derived hop count (glossary): -1 for the Sink, uplink.hop+1 for a
    /// connected Node, 255 (no-uplink sentinel) when disconnected.
    pub fn hop_count(&self) -> i16 {
        if self.is_sink {
            return crate::transport::HOP_SINK;
        }
        match &*self.uplink.read() {
            Some(rec) => rec.hop_count,
            None => HOP_NO_UPLINK,
        }
    }

    pub fn uplink_snapshot(&self) -> Option<LinkRecord> {
        self.uplink.read().clone()
    }

    pub fn downlinks_snapshot(&self) -> Vec<LinkRecord> {
        self.downlinks.read().values().cloned().collect()
    }

    fn open_control_channel(&self, port: PortId) -> ControlChannel {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending_channels.write().insert(port.clone(), tx);
        ControlChannel {
            transport: self.transport.clone(),
            port,
            self_nid: self.self_nid,
            sequence: std::sync::atomic::AtomicU32::new(0),
            rx,
        }
    }

    fn close_control_channel(&self, port: &PortId) {
        self.pending_channels.write().remove(port);
    }

    /// Feeds a raw AUTH_REQUEST/AUTH_RESPONSE frame received on `port` to
    /// whichever handshake is currently waiting on it. Called by the
    /// composition root's inbound dispatcher; frames arriving with no
    /// pending handshake are silently dropped (no handshake expects them).
    pub fn handle_inbound_control(&self, port: PortId, bytes: Vec<u8>) {
        if let Some(tx) = self.pending_channels.read().get(&port) {
            let _ = tx.send(bytes);
        }
    }

    fn is_cooled_down(&self, address: &str) -> bool {
        match self.cooldown.read().get(address) {
            Some(at) => at.elapsed() < COOLDOWN,
            None => false,
        }
    }

    fn rank_candidates(&self, mut neighbours: Vec<Neighbour>) -> Vec<Neighbour> {
        neighbours.retain(|n| {
            n.advertised_hop < HOP_PERIPHERAL_ONLY
                && n.device_type != DeviceType::PeripheralOnly
                && !self.is_cooled_down(&n.address)
        });
        neighbours.sort_by(|a, b| {
            a.advertised_hop
                .cmp(&b.advertised_hop)
                .then(b.rssi.cmp(&a.rssi))
        });
        neighbours
    }

    /// Lazy uplink (re)selection (§4.9 steps 1-5). Scans, ranks, connects
    /// to and authenticates against candidates in order until one
    /// succeeds. Returns the winning handshake outcome so the caller
    /// (the Node composition root) can capture the end-to-end key when
    /// the peer turns out to be the Sink.
    pub async fn select_uplink(&self) -> Result<HandshakeOutcome, LinkError> {
        if self.is_sink {
            return Err(LinkError::NoUplinkCandidate);
        }
        let neighbours = self.transport.scan(self.config.scan_timeout).await?;
        let ranked = self.rank_candidates(neighbours);

        for candidate in ranked {
            match self.try_connect_uplink(&candidate).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    warn!(target: "canopy::linkmgr", address = %candidate.address, error = %e, "uplink candidate failed");
                    self.cooldown.write().insert(candidate.address.clone(), Instant::now());
                }
            }
        }
        Err(LinkError::NoUplinkCandidate)
    }

    async fn try_connect_uplink(&self, candidate: &Neighbour) -> Result<HandshakeOutcome, LinkError> {
        let port = self.transport.connect(&candidate.address).await?;
        let mut channel = self.open_control_channel(port.clone());
        let result = run_initiator(&self.credentials, &self.ca_der, &mut channel, self.config.auth_timeout, true).await;
        self.close_control_channel(&port);

        match result {
            Ok(outcome) => {
                let hop_count = candidate.advertised_hop.saturating_add(1);
                self.router.set_session_key(port.clone(), outcome.peer_nid, outcome.session_keys.clone());
                self.router.set_default_route(Some(port.clone()));
                *self.uplink.write() = Some(LinkRecord {
                    peer_nid: outcome.peer_nid,
                    port: port.clone(),
                    authenticated: true,
                    hop_count,
                });
                self.transport.update_advertisement(hop_count).await.ok();
                info!(target: "canopy::linkmgr", peer = %outcome.peer_nid, hop_count, "uplink established");
                Ok(outcome)
            }
            Err(e) => {
                self.transport.disconnect(&port).await.ok();
                Err(LinkError::Auth(e))
            }
        }
    }

    /// Runs the responder role against a peer that just connected to us
    /// (we are its uplink). Every accepted link — uplink or downlink —
    /// gets full mutual authentication (§9).
    pub async fn accept_downlink(&self, port: PortId) -> Result<HandshakeOutcome, LinkError> {
        let mut channel = self.open_control_channel(port.clone());
        let derive_e2e = self.is_sink;
        let result = run_responder(&self.credentials, &self.ca_der, &mut channel, self.config.auth_timeout, derive_e2e).await;
        self.close_control_channel(&port);

        match result {
            Ok(outcome) => {
                self.router.set_session_key(port.clone(), outcome.peer_nid, outcome.session_keys.clone());
                self.downlinks.write().insert(
                    port.clone(),
                    LinkRecord {
                        peer_nid: outcome.peer_nid,
                        port,
                        authenticated: true,
                        hop_count: 0,
                    },
                );
                info!(target: "canopy::linkmgr", peer = %outcome.peer_nid, "downlink accepted");
                Ok(outcome)
            }
            Err(e) => {
                self.transport.disconnect(&port).await.ok();
                Err(LinkError::Auth(e))
            }
        }
    }

    /// Heartbeat watchdog fired (§4.7): mark no-uplink, tear down the
    /// uplink port, and cascade-disconnect every downlink so they
    /// independently rediscover their own uplink loss.
    pub async fn handle_uplink_dead(&self) {
        let old_uplink = self.uplink.write().take();
        if let Some(rec) = old_uplink {
            warn!(target: "canopy::linkmgr", peer = %rec.peer_nid, "uplink declared dead");
            self.router.clear_session_key(&rec.port);
            self.router.set_default_route(None);
            let _ = self.transport.disconnect(&rec.port).await;
        }
        let _ = self.transport.update_advertisement(HOP_NO_UPLINK).await;

        let downlink_ports: Vec<PortId> = self.downlinks.write().drain().map(|(p, _)| p).collect();
        for port in downlink_ports {
            self.router.clear_session_key(&port);
            let _ = self.transport.disconnect(&port).await;
        }
    }

    /// Evicts a downlink that the transport reported as disconnected
    /// (link-level transport error reclassified by the caller, §7).
    pub fn evict_downlink(&self, port: &PortId) {
        if self.downlinks.write().remove(port).is_some() {
            self.router.clear_session_key(port);
        }
    }
}
