//! The Node composition root (§4.10): dual role as leaf sensor and
//! interior router, always exactly zero or one uplink away from working
//! connectivity to the Sink.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use canopy_protocol::crypto::identity::NodeCredentials;
use canopy_protocol::crypto::{aead_decrypt, aead_encrypt, EndToEndKey};
use canopy_protocol::heartbeat::HeartbeatWatchdog;
use canopy_protocol::linkmgr::{LinkError, LinkManager};
use canopy_protocol::messages::HeartbeatPayload;
use canopy_protocol::packet::{MsgType, Nid, Packet};
use canopy_protocol::router::RouterDaemon;
use canopy_protocol::transport::PortId;
use canopy_protocol::{Config, E2eChannelHub};
use p521::ecdsa::VerifyingKey;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::dispatch::install_dispatcher;
use crate::mesh::LoopbackTransport;

#[derive(Debug, Error, Clone)]
pub enum NodeError {
    #[error("no working uplink to the Sink")]
    NoUplink,
    #[error("end-to-end key with the Sink not yet established")]
    NoEndToEndKey,
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Send(#[from] canopy_protocol::router::SendError),
    #[error(transparent)]
    Crypto(#[from] canopy_protocol::CryptoError),
}

pub struct NodeDevice {
    nid: Nid,
    config: Arc<Config>,
    credentials: Arc<NodeCredentials>,
    ca_der: Vec<u8>,
    router: Arc<RouterDaemon>,
    linkmgr: Arc<LinkManager>,
    e2e_hub: Arc<E2eChannelHub>,
    watchdog: Mutex<Option<Arc<HeartbeatWatchdog>>>,
    sink_nid: Mutex<Option<Nid>>,
    sink_verifying_key: Mutex<Option<VerifyingKey>>,
    own_e2e_key: Mutex<Option<EndToEndKey>>,
    e2e_bootstrap_started: Mutex<bool>,
    received: Mutex<Vec<Vec<u8>>>,
    sequence: AtomicU32,
    shutdown_tx: watch::Sender<bool>,
}

impl NodeDevice {
    pub fn new(
        credentials: NodeCredentials,
        ca_der: Vec<u8>,
        config: Config,
        transport: Arc<LoopbackTransport>,
    ) -> Arc<Self> {
        let nid = credentials.nid;
        let credentials = Arc::new(credentials);
        let config = Arc::new(config);

        let dyn_transport: Arc<dyn canopy_protocol::transport::LinkTransport> = transport.clone();
        let router = Arc::new(RouterDaemon::new(nid, false, config.clone(), dyn_transport.clone()));
        let linkmgr = Arc::new(LinkManager::new(
            nid,
            false,
            config.clone(),
            dyn_transport,
            router.clone(),
            credentials.clone(),
            ca_der.clone(),
        ));
        let e2e_hub = E2eChannelHub::new(router.clone(), nid);
        let (shutdown_tx, _rx) = watch::channel(false);

        let node = Arc::new(Self {
            nid,
            config,
            credentials: credentials.clone(),
            ca_der,
            router: router.clone(),
            linkmgr: linkmgr.clone(),
            e2e_hub,
            watchdog: Mutex::new(None),
            sink_nid: Mutex::new(None),
            sink_verifying_key: Mutex::new(None),
            own_e2e_key: Mutex::new(None),
            e2e_bootstrap_started: Mutex::new(false),
            received: Mutex::new(Vec::new()),
            sequence: AtomicU32::new(0),
            shutdown_tx,
        });

        install_dispatcher(&transport, &linkmgr, &router);
        {
            let linkmgr = linkmgr.clone();
            transport.set_connection_handler(Arc::new(move |port: PortId| {
                let linkmgr = linkmgr.clone();
                tokio::spawn(async move {
                    if let Err(e) = linkmgr.accept_downlink(port).await {
                        warn!(target: "canopy::linkmgr", error = %e, "downlink authentication failed");
                    }
                });
            }));
        }

        let node_for_heartbeat = node.clone();
        router.register_local_handler(
            MsgType::Heartbeat,
            Arc::new(move |packet: &Packet, _port: &PortId| node_for_heartbeat.on_heartbeat(packet)),
        );

        let node_for_data = node.clone();
        router.register_local_handler(
            MsgType::Data,
            Arc::new(move |packet: &Packet, _port: &PortId| node_for_data.on_data(packet)),
        );

        node
    }

    pub fn nid(&self) -> Nid {
        self.nid
    }

    pub fn router(&self) -> &Arc<RouterDaemon> {
        &self.router
    }

    pub fn link_manager(&self) -> &Arc<LinkManager> {
        &self.linkmgr
    }

    pub fn hop_count(&self) -> i16 {
        self.linkmgr.hop_count()
    }

    /// Age of the last heartbeat accepted from the uplink, for operator
    /// visibility into the watchdog. `None` before the first
    /// [`NodeDevice::connect_uplink`] call has installed one.
    pub fn heartbeat_age(&self) -> Option<std::time::Duration> {
        self.watchdog.lock().as_ref().map(|w| w.last_heartbeat_age())
    }

    /// Current value of the DATA sequence counter, for operator
    /// visibility; the next [`NodeDevice::send_message`] call consumes it.
    pub fn send_sequence(&self) -> u32 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Runs the uplink (re)selection state machine once. On success,
    /// captures the Sink's verifying key and, when the newly-selected
    /// uplink *is* the Sink, the end-to-end key produced by that very
    /// handshake directly. When the uplink is an intermediate Node, the
    /// genuine Node-Sink end-to-end key is established separately once the
    /// Sink's NID is learned (see [`NodeDevice::on_heartbeat`]).
    pub async fn connect_uplink(self: &Arc<Self>) -> Result<(), NodeError> {
        let outcome = self.linkmgr.select_uplink().await?;
        if outcome.peer_is_sink {
            *self.sink_nid.lock() = Some(outcome.peer_nid);
            *self.sink_verifying_key.lock() = Some(outcome.peer_verifying_key);
            if let Some(key) = outcome.end_to_end_key {
                *self.own_e2e_key.lock() = Some(key);
            }
            info!(target: "canopy::linkmgr", sink = %outcome.peer_nid, "direct link to sink established");
        }
        let watchdog = Arc::new(HeartbeatWatchdog::new(
            self.config.heartbeat_interval,
            self.config.heartbeat_miss_threshold,
        ));
        *self.watchdog.lock() = Some(watchdog);
        Ok(())
    }

    /// Starts the uplink-loss watchdog. Must be (re)called after every
    /// successful [`NodeDevice::connect_uplink`], since the watchdog loop
    /// exits once it fires.
    pub fn spawn_watchdog_loop(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let watchdog = self.watchdog.lock().clone()?;
        let node = self.clone();
        let tick = self.config.tick_interval;
        let shutdown_rx = self.shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            canopy_protocol::heartbeat::run_watchdog_loop(watchdog, tick, shutdown_rx, move || {
                let node = node.clone();
                tokio::spawn(async move {
                    node.declare_uplink_dead().await;
                });
            })
            .await;
        }))
    }

    async fn declare_uplink_dead(&self) {
        warn!(target: "canopy::linkmgr", node = %self.nid, "uplink declared dead");
        self.linkmgr.handle_uplink_dead().await;
        *self.sink_nid.lock() = None;
        *self.sink_verifying_key.lock() = None;
        *self.own_e2e_key.lock() = None;
        *self.e2e_bootstrap_started.lock() = false;
    }

    fn on_heartbeat(self: &Arc<Self>, packet: &Packet) -> bool {
        let Some(unverified) = HeartbeatPayload::decode(&packet.payload) else {
            return false;
        };
        if self.sink_nid.lock().is_none() {
            *self.sink_nid.lock() = Some(unverified.sink_nid);
        }

        let verifying_key = self.sink_verifying_key.lock().clone();
        let Some(verifying_key) = verifying_key else {
            self.try_bootstrap_end_to_end(unverified.sink_nid);
            return false;
        };

        match canopy_protocol::heartbeat::verify_heartbeat_payload(&packet.payload, packet.sequence, &verifying_key) {
            Ok(_) => {
                if let Some(watchdog) = self.watchdog.lock().clone() {
                    watchdog.record_heartbeat();
                }
                true
            }
            Err(_) => false,
        }
    }

    fn try_bootstrap_end_to_end(self: &Arc<Self>, sink_nid: Nid) {
        let mut started = self.e2e_bootstrap_started.lock();
        if *started {
            return;
        }
        *started = true;
        drop(started);

        let node = self.clone();
        tokio::spawn(async move {
            let result = node
                .e2e_hub
                .initiate(sink_nid, &node.credentials, &node.ca_der, node.config.auth_timeout)
                .await;
            match result {
                Ok(outcome) => {
                    *node.sink_verifying_key.lock() = Some(outcome.peer_verifying_key);
                    if let Some(key) = outcome.end_to_end_key {
                        *node.own_e2e_key.lock() = Some(key);
                    }
                    info!(target: "canopy::router", sink = %sink_nid, "end-to-end key established with distant sink");
                }
                Err(e) => {
                    warn!(target: "canopy::router", sink = %sink_nid, error = %e, "end-to-end handshake with sink failed");
                    *node.e2e_bootstrap_started.lock() = false;
                }
            }
        });
    }

    fn on_data(&self, packet: &Packet) -> bool {
        let Some(sink_nid) = *self.sink_nid.lock() else {
            return false;
        };
        if packet.source != sink_nid {
            return false;
        }
        let Some(key) = self.own_e2e_key.lock().clone() else {
            return false;
        };
        let Ok(plaintext) = aead_decrypt(&key, &packet.payload) else {
            return false;
        };
        self.received.lock().push(plaintext);
        true
    }

    /// Returns the plaintext messages the Sink has sent this Node so far.
    pub fn received_messages(&self) -> Vec<Vec<u8>> {
        self.received.lock().clone()
    }

    /// AEAD-wraps `bytes` under the end-to-end key and originates a DATA
    /// frame toward the Sink (§4.10's `send_message`).
    pub async fn send_message(&self, bytes: Vec<u8>) -> Result<(), NodeError> {
        let sink_nid = self.sink_nid.lock().ok_or(NodeError::NoUplink)?;
        let key = self.own_e2e_key.lock().clone().ok_or(NodeError::NoEndToEndKey)?;
        let ciphertext = aead_encrypt(&key, &bytes).map_err(|_| NodeError::NoEndToEndKey)?;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.router.send(sink_nid, MsgType::Data, ciphertext, sequence).await?;
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
