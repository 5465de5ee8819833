//! The router daemon: the central learning-switch forwarder (§4.8).
//!
//! Verifies the incoming per-link MAC, learns source-to-port mappings,
//! decides local-deliver vs forward, rewrites the MAC for the outbound
//! link, decrements TTL, and treats HEARTBEAT as an authenticated
//! broadcast. Every failure path here is local: a packet-pipeline error
//! increments a counter and returns, never unwinding (§7) — a single bad
//! peer cannot stall the router.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::crypto::{compute_mac, verify_mac, SessionKeys};
use crate::packet::{CodecError, MsgType, Nid, Packet};
use crate::replay::{ReplayOutcome, ReplayTable};
use crate::transport::{LinkTransport, PortId, TransportError};

/// A registered per-type local-delivery callback. Returns `false` to
/// signal an authenticity failure specific to that message type (e.g. a
/// HEARTBEAT's inner ECDSA signature not verifying) — treated by the
/// router as equivalent to a MAC failure and counted under
/// `dropped_mac`, matching §7's grouping of MAC/signature failures
/// under one "authenticity errors" taxonomy entry.
pub type LocalHandler = Arc<dyn Fn(&Packet, &PortId) -> bool + Send + Sync>;

/// Invoked when a transport write during forwarding fails, so the link
/// manager can reclassify it as port loss (§7: transport errors bubble
/// up exactly one level). The router itself never retries or blocks.
pub type TransportErrorHandler = Arc<dyn Fn(PortId, TransportError) + Send + Sync>;

/// Plain, `Copy` snapshot of the router's counters (§4.8), following the
/// teacher's metrics-snapshot idiom: readable without holding a lock
/// across the read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStatsSnapshot {
    pub routed: u64,
    pub delivered_local: u64,
    pub dropped_ttl: u64,
    pub dropped_mac: u64,
    pub dropped_replay: u64,
    pub dropped_no_route: u64,
    pub dropped_parse: u64,
}

#[derive(Debug, Default)]
struct RouterStats {
    routed: AtomicU64,
    delivered_local: AtomicU64,
    dropped_ttl: AtomicU64,
    dropped_mac: AtomicU64,
    dropped_replay: AtomicU64,
    dropped_no_route: AtomicU64,
    dropped_parse: AtomicU64,
}

impl RouterStats {
    fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            routed: self.routed.load(Ordering::Relaxed),
            delivered_local: self.delivered_local.load(Ordering::Relaxed),
            dropped_ttl: self.dropped_ttl.load(Ordering::Relaxed),
            dropped_mac: self.dropped_mac.load(Ordering::Relaxed),
            dropped_replay: self.dropped_replay.load(Ordering::Relaxed),
            dropped_no_route: self.dropped_no_route.load(Ordering::Relaxed),
            dropped_parse: self.dropped_parse.load(Ordering::Relaxed),
        }
    }
}

/// Errors returned by locally-originated sends (§4.8's `send` operation).
/// Unlike pipeline errors, these do propagate to the caller — there is no
/// "drop and continue" for a send the application explicitly asked for.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("no route to destination and no default uplink route")]
    NoRoute,
    #[error("no session key installed for outbound port")]
    NoSessionKey,
    #[error("packet codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// The switching core. One instance per device (Sink or Node).
pub struct RouterDaemon {
    self_nid: Nid,
    is_sink: bool,
    config: Arc<Config>,
    transport: Arc<dyn LinkTransport>,
    forwarding_table: RwLock<HashMap<Nid, PortId>>,
    session_keys: RwLock<HashMap<PortId, SessionKeys>>,
    replay: ReplayTable,
    stats: RouterStats,
    /// The default forwarding rule for a Node: its current uplink. `None`
    /// for the Sink (which has no default and drops unknown-destination
    /// unicasts) and for a disconnected Node.
    default_route: RwLock<Option<PortId>>,
    handlers: RwLock<HashMap<u8, LocalHandler>>,
    on_transport_error: RwLock<Option<TransportErrorHandler>>,
}

impl RouterDaemon {
    pub fn new(self_nid: Nid, is_sink: bool, config: Arc<Config>, transport: Arc<dyn LinkTransport>) -> Self {
        let replay = ReplayTable::new(config.replay_window_size);
        Self {
            self_nid,
            is_sink,
            config,
            transport,
            forwarding_table: RwLock::new(HashMap::new()),
            session_keys: RwLock::new(HashMap::new()),
            replay,
            stats: RouterStats::default(),
            default_route: RwLock::new(None),
            handlers: RwLock::new(HashMap::new()),
            on_transport_error: RwLock::new(None),
        }
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn forwarding_table_snapshot(&self) -> HashMap<Nid, PortId> {
        self.forwarding_table.read().clone()
    }

    /// Installs a callback for locally-delivered packets of `msg_type`.
    pub fn register_local_handler(&self, msg_type: MsgType, handler: LocalHandler) {
        self.handlers.write().insert(msg_type as u8, handler);
    }

    pub fn set_transport_error_handler(&self, handler: TransportErrorHandler) {
        *self.on_transport_error.write() = Some(handler);
    }

    /// Called by the link manager on authentication success. Per §4.5,
    /// installing a new session key also resets the peer's replay window
    /// across every message type, re-initialising its counter space.
    pub fn set_session_key(&self, port: PortId, peer_nid: Nid, keys: SessionKeys) {
        self.session_keys.write().insert(port, keys);
        self.replay.reset_peer(peer_nid);
    }

    /// Called by the link manager on disconnect.
    pub fn clear_session_key(&self, port: &PortId) {
        self.session_keys.write().remove(port);
        self.forwarding_table.write().retain(|_, p| p != port);
    }

    /// Called by the link manager whenever the uplink changes (Nodes only).
    pub fn set_default_route(&self, port: Option<PortId>) {
        *self.default_route.write() = port;
    }

    fn select_mac_key(&self, msg_type: MsgType, port: &PortId) -> Option<[u8; 32]> {
        if msg_type == MsgType::Heartbeat {
            Some(self.config.broadcast_mac_key)
        } else {
            self.session_keys.read().get(port).map(|k| k.mac_link)
        }
    }

    fn outbound_key(&self, port: &PortId) -> Option<[u8; 32]> {
        self.session_keys.read().get(port).map(|k| k.mac_link)
    }

    /// Invoked by the transport on any inbound frame.
    pub async fn receive(&self, port: PortId, raw_bytes: Vec<u8>) {
        let packet = match Packet::decode(&raw_bytes) {
            Ok(p) => p,
            Err(e) => {
                self.stats.dropped_parse.fetch_add(1, Ordering::Relaxed);
                trace!(target: "canopy::router", error = %e, "dropped: parse error");
                return;
            }
        };

        let Some(key) = self.select_mac_key(packet.msg_type, &port) else {
            self.stats.dropped_mac.fetch_add(1, Ordering::Relaxed);
            trace!(target: "canopy::router", port = %port, "dropped: no session key for port");
            return;
        };
        if !verify_mac(&key, &packet.mac_input(), &packet.mac) {
            self.stats.dropped_mac.fetch_add(1, Ordering::Relaxed);
            warn!(target: "canopy::router", port = %port, "dropped: MAC mismatch");
            return;
        }

        match self.replay.check_and_record(packet.source, packet.msg_type, packet.sequence) {
            ReplayOutcome::Accepted => {}
            ReplayOutcome::Duplicate | ReplayOutcome::TooOld => {
                self.stats.dropped_replay.fetch_add(1, Ordering::Relaxed);
                trace!(target: "canopy::router", port = %port, sequence = packet.sequence, "dropped: replay");
                return;
            }
        }

        if packet.source != self.self_nid {
            self.forwarding_table.write().insert(packet.source, port.clone());
            debug!(target: "canopy::router", source = %packet.source, port = %port, "learned forwarding entry");
        }

        self.dispatch(packet, port).await;
    }

    async fn invoke_handler(&self, msg_type: MsgType, packet: &Packet, port: &PortId) -> bool {
        let handler = self.handlers.read().get(&(msg_type as u8)).cloned();
        match handler {
            Some(h) => h(packet, port),
            None => true,
        }
    }

    async fn dispatch(&self, packet: Packet, port: PortId) {
        if packet.msg_type == MsgType::Heartbeat {
            self.dispatch_heartbeat(packet, port).await;
            return;
        }

        if packet.destination == self.self_nid {
            if self.invoke_handler(packet.msg_type, &packet, &port).await {
                self.stats.delivered_local.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.dropped_mac.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        if packet.destination == Nid::BROADCAST {
            // No other broadcast message types are defined.
            self.stats.dropped_no_route.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.forward_unicast(packet, port).await;
    }

    async fn dispatch_heartbeat(&self, packet: Packet, incoming_port: PortId) {
        let authentic = self.invoke_handler(MsgType::Heartbeat, &packet, &incoming_port).await;
        if !authentic {
            self.stats.dropped_mac.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.stats.delivered_local.fetch_add(1, Ordering::Relaxed);

        if packet.ttl <= 1 {
            return;
        }
        let mut forwarded = packet;
        forwarded.ttl -= 1;
        let mac_input = forwarded.mac_input();
        forwarded.mac = compute_mac(&self.config.broadcast_mac_key, &mac_input);
        let bytes = match forwarded.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!(target: "canopy::router", error = %e, "failed to encode heartbeat forward");
                return;
            }
        };
        if let Err(e) = self.transport.broadcast(bytes, &[incoming_port]).await {
            warn!(target: "canopy::router", error = %e, "heartbeat broadcast forward failed");
        } else {
            self.stats.routed.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn forward_unicast(&self, packet: Packet, incoming_port: PortId) {
        if packet.ttl == 0 {
            self.stats.dropped_ttl.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let new_ttl = packet.ttl - 1;
        if new_ttl == 0 {
            self.stats.dropped_ttl.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let out_port = match self.forwarding_table.read().get(&packet.destination).cloned() {
            Some(p) => Some(p),
            None if !self.is_sink => self.default_route.read().clone(),
            None => None,
        };
        let Some(out_port) = out_port else {
            self.stats.dropped_no_route.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if out_port == incoming_port {
            self.stats.dropped_no_route.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some(key) = self.outbound_key(&out_port) else {
            self.stats.dropped_no_route.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let mut forwarded = packet;
        forwarded.ttl = new_ttl;
        let mac_input = forwarded.mac_input();
        forwarded.mac = compute_mac(&key, &mac_input);
        let bytes = match forwarded.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!(target: "canopy::router", error = %e, "failed to encode forward");
                return;
            }
        };
        match self.transport.send(&out_port, bytes).await {
            Ok(()) => {
                self.stats.routed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                if let Some(handler) = self.on_transport_error.read().clone() {
                    handler(out_port, e);
                }
            }
        }
    }

    /// Originates a locally-produced unicast frame (`msg_type != Heartbeat`).
    pub async fn send(
        &self,
        destination: Nid,
        msg_type: MsgType,
        payload: Vec<u8>,
        sequence: u32,
    ) -> Result<(), SendError> {
        let out_port = self
            .forwarding_table
            .read()
            .get(&destination)
            .cloned()
            .or_else(|| if !self.is_sink { self.default_route.read().clone() } else { None })
            .ok_or(SendError::NoRoute)?;
        let key = self.outbound_key(&out_port).ok_or(SendError::NoSessionKey)?;

        let mut packet = Packet::new(self.self_nid, destination, msg_type, self.config.ttl_default, sequence, payload);
        let mac_input = packet.mac_input();
        packet.mac = compute_mac(&key, &mac_input);
        let bytes = packet.encode()?;
        self.transport.send(&out_port, bytes).await?;
        Ok(())
    }

    /// Originates a HEARTBEAT flood (Sink only, but not enforced here —
    /// the composition root is responsible for only calling this from the
    /// Sink device).
    pub async fn originate_heartbeat(
        &self,
        sequence: u32,
        payload: Vec<u8>,
        exclude: &[PortId],
    ) -> Result<(), SendError> {
        let mut packet = Packet::new(
            self.self_nid,
            Nid::BROADCAST,
            MsgType::Heartbeat,
            self.config.ttl_default,
            sequence,
            payload,
        );
        let mac_input = packet.mac_input();
        packet.mac = compute_mac(&self.config.broadcast_mac_key, &mac_input);
        let bytes = packet.encode()?;
        self.transport.broadcast(bytes, exclude).await?;
        Ok(())
    }
}
