//! End-to-end key establishment between a Node and the Sink when they are
//! not adjacent in the tree.
//!
//! The per-link authentication handshake (§4.5) runs only between
//! directly-connected peers, so it can derive `K_link` for every hop but
//! cannot by itself give a Node more than one hop from the Sink a shared
//! secret with the Sink. Spec.md §3/§9 are explicit that only the two
//! tree endpoints ever hold `K_e2e`, so this module runs a *second*
//! instance of the same mutual-authentication state machine
//! (`handshake::client`/`handshake::server`) between the two endpoints,
//! carried as ordinary CONTROL packets forwarded hop-by-hop by the
//! already-functioning router — rather than over the dedicated per-link
//! control channel used for `K_link` establishment. See DESIGN.md for
//! why this is the resolution chosen for an ambiguity the distilled spec
//! leaves implicit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::crypto::identity::NodeCredentials;
use crate::handshake::{client::run_initiator, server::run_responder, AuthChannel, AuthError, HandshakeOutcome};
use crate::messages::AuthEnvelope;
use crate::packet::{MsgType, Nid, Packet};
use crate::router::RouterDaemon;

struct RoutedControlChannel {
    router: Arc<RouterDaemon>,
    self_nid: Nid,
    peer_nid: Nid,
    sequence: AtomicU32,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl AuthChannel for RoutedControlChannel {
    async fn send(&mut self, envelope: AuthEnvelope) -> Result<(), AuthError> {
        let payload = serde_cbor::to_vec(&envelope).map_err(|e| AuthError::Channel(e.to_string()))?;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.router
            .send(self.peer_nid, MsgType::Control, payload, sequence)
            .await
            .map_err(|e| AuthError::Channel(e.to_string()))
    }

    async fn recv(&mut self) -> Result<AuthEnvelope, AuthError> {
        let payload = self
            .rx
            .recv()
            .await
            .ok_or_else(|| AuthError::Channel("routed control channel closed".into()))?;
        serde_cbor::from_slice(&payload).map_err(|e| AuthError::Channel(e.to_string()))
    }
}

/// Demultiplexes inbound CONTROL packets by source NID to whichever
/// end-to-end handshake is in progress with that peer, and accepts
/// handshakes opened by peers we did not initiate toward (the Sink's
/// role: any deep Node may open one at any time).
pub struct E2eChannelHub {
    router: Arc<RouterDaemon>,
    self_nid: Nid,
    inboxes: RwLock<HashMap<Nid, mpsc::UnboundedSender<Vec<u8>>>>,
    new_sessions_tx: mpsc::UnboundedSender<(Nid, Vec<u8>)>,
    new_sessions_rx: Mutex<Option<mpsc::UnboundedReceiver<(Nid, Vec<u8>)>>>,
    on_established: RwLock<Option<Arc<dyn Fn(Nid, HandshakeOutcome) + Send + Sync>>>,
}

impl E2eChannelHub {
    pub fn new(router: Arc<RouterDaemon>, self_nid: Nid) -> Arc<Self> {
        let (new_sessions_tx, new_sessions_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Self {
            router: router.clone(),
            self_nid,
            inboxes: RwLock::new(HashMap::new()),
            new_sessions_tx,
            new_sessions_rx: Mutex::new(Some(new_sessions_rx)),
            on_established: RwLock::new(None),
        });
        let dispatch_hub = hub.clone();
        router.register_local_handler(
            MsgType::Control,
            Arc::new(move |packet: &Packet, _port| {
                dispatch_hub.dispatch_inbound(packet);
                true
            }),
        );
        hub
    }

    /// Registers a callback invoked whenever a responder-side handshake
    /// this hub accepted completes successfully (used by the Sink to
    /// capture the resulting end-to-end key, keyed by the Node's NID).
    pub fn set_on_established(&self, callback: Arc<dyn Fn(Nid, HandshakeOutcome) + Send + Sync>) {
        *self.on_established.write() = Some(callback);
    }

    fn dispatch_inbound(&self, packet: &Packet) {
        let existing = self.inboxes.read().get(&packet.source).cloned();
        match existing {
            Some(tx) => {
                let _ = tx.send(packet.payload.clone());
            }
            None => {
                let _ = self.new_sessions_tx.send((packet.source, packet.payload.clone()));
            }
        }
    }

    /// Initiates an end-to-end handshake with `peer_nid` (a Node reaching
    /// toward the Sink). `derive_e2e` is always `true` here; this hub only
    /// exists to establish `K_e2e`.
    pub async fn initiate(
        &self,
        peer_nid: Nid,
        credentials: &NodeCredentials,
        ca_der: &[u8],
        timeout: Duration,
    ) -> Result<HandshakeOutcome, AuthError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().insert(peer_nid, tx);
        let mut channel = RoutedControlChannel {
            router: self.router.clone(),
            self_nid: self.self_nid,
            peer_nid,
            sequence: AtomicU32::new(0),
            rx,
        };
        let result = run_initiator(credentials, ca_der, &mut channel, timeout, true).await;
        self.inboxes.write().remove(&peer_nid);
        result
    }

    /// Spawns the loop that accepts end-to-end handshakes opened by
    /// distant peers. Call once, on the Sink.
    pub fn spawn_responder_acceptor(
        self: &Arc<Self>,
        credentials: Arc<NodeCredentials>,
        ca_der: Arc<Vec<u8>>,
        timeout: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let mut new_sessions_rx = self
            .new_sessions_rx
            .lock()
            .take()
            .expect("responder acceptor already spawned");
        let hub = self.clone();
        tokio::spawn(async move {
            while let Some((peer_nid, first_payload)) = new_sessions_rx.recv().await {
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = tx.send(first_payload);
                hub.inboxes.write().insert(peer_nid, tx);
                let hub = hub.clone();
                let credentials = credentials.clone();
                let ca_der = ca_der.clone();
                tokio::spawn(async move {
                    let mut channel = RoutedControlChannel {
                        router: hub.router.clone(),
                        self_nid: hub.self_nid,
                        peer_nid,
                        sequence: AtomicU32::new(0),
                        rx,
                    };
                    let result = run_responder(&credentials, &ca_der, &mut channel, timeout, true).await;
                    hub.inboxes.write().remove(&peer_nid);
                    if let Ok(outcome) = result {
                        if let Some(cb) = hub.on_established.read().clone() {
                            cb(peer_nid, outcome);
                        }
                    }
                });
            }
        })
    }
}
