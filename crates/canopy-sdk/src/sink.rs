//! The Sink composition root (§4.10): tree root, terminates end-to-end
//! AEAD, never has an uplink.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use canopy_protocol::crypto::identity::NodeCredentials;
use canopy_protocol::crypto::{aead_decrypt, EndToEndKey};
use canopy_protocol::heartbeat::{HeartbeatBlockedSet, HeartbeatProducer};
use canopy_protocol::linkmgr::LinkManager;
use canopy_protocol::packet::{MsgType, Nid, Packet};
use canopy_protocol::router::RouterDaemon;
use canopy_protocol::transport::PortId;
use canopy_protocol::{Config, E2eChannelHub};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::dispatch::install_dispatcher;
use crate::mesh::LoopbackTransport;

/// One plaintext message recovered from a Node's end-to-end DATA frame.
#[derive(Debug, Clone)]
pub struct InboxEntry {
    pub timestamp_secs: u64,
    pub source_nid: Nid,
    pub plaintext: Vec<u8>,
}

/// Composes the heartbeat producer, router daemon, link manager
/// (downlinks only), the end-to-end key hub, and the in-memory inbox.
pub struct SinkDevice {
    nid: Nid,
    config: Arc<Config>,
    router: Arc<RouterDaemon>,
    linkmgr: Arc<LinkManager>,
    heartbeat_producer: Arc<HeartbeatProducer>,
    blocked: Arc<HeartbeatBlockedSet>,
    e2e_hub: Arc<E2eChannelHub>,
    e2e_keys: Mutex<HashMap<Nid, EndToEndKey>>,
    inbox: Mutex<Vec<InboxEntry>>,
    shutdown_tx: watch::Sender<bool>,
}

impl SinkDevice {
    /// Wires a Sink onto the given transport. `credentials.is_sink` must be
    /// `true`; `ca_der` is the trusted CA certificate (see
    /// `canopy_protocol::crypto::identity::read_ca_certificate`) used to
    /// validate every peer that authenticates against this device.
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
        let router = Arc::new(RouterDaemon::new(nid, true, config.clone(), dyn_transport.clone()));
        let linkmgr = Arc::new(LinkManager::new(
            nid,
            true,
            config.clone(),
            dyn_transport,
            router.clone(),
            credentials.clone(),
            ca_der.clone(),
        ));
        let e2e_hub = E2eChannelHub::new(router.clone(), nid);
        let heartbeat_producer = Arc::new(HeartbeatProducer::new(nid, credentials.signing_key.clone()));
        let blocked = Arc::new(HeartbeatBlockedSet::new());
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);

        let sink = Arc::new(Self {
            nid,
            config,
            router: router.clone(),
            linkmgr: linkmgr.clone(),
            heartbeat_producer,
            blocked,
            e2e_hub: e2e_hub.clone(),
            e2e_keys: Mutex::new(HashMap::new()),
            inbox: Mutex::new(Vec::new()),
            shutdown_tx,
        });

        install_dispatcher(&transport, &linkmgr, &router);
        {
            let linkmgr = linkmgr.clone();
            let sink_for_downlink = sink.clone();
            transport.set_connection_handler(Arc::new(move |port: PortId| {
                let linkmgr = linkmgr.clone();
                let sink_for_downlink = sink_for_downlink.clone();
                tokio::spawn(async move {
                    match linkmgr.accept_downlink(port).await {
                        Ok(outcome) => {
                            if let Some(key) = outcome.end_to_end_key {
                                sink_for_downlink.e2e_keys.lock().insert(outcome.peer_nid, key);
                                info!(target: "canopy::router", peer = %outcome.peer_nid, "end-to-end key established with adjacent node");
                            }
                        }
                        Err(e) => {
                            warn!(target: "canopy::linkmgr", error = %e, "downlink authentication failed");
                        }
                    }
                });
            }));
        }

        let sink_for_e2e = sink.clone();
        e2e_hub.set_on_established(Arc::new(move |peer_nid, outcome| {
            if let Some(key) = outcome.end_to_end_key {
                sink_for_e2e.e2e_keys.lock().insert(peer_nid, key);
                info!(target: "canopy::router", peer = %peer_nid, "end-to-end key established with distant node");
            }
        }));
        e2e_hub.spawn_responder_acceptor(credentials, Arc::new(ca_der), sink.config.auth_timeout);

        let sink_for_handler = sink.clone();
        router.register_local_handler(
            MsgType::Data,
            Arc::new(move |packet: &Packet, _port: &PortId| sink_for_handler.deliver_local_data(packet)),
        );

        sink
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

    fn deliver_local_data(&self, packet: &Packet) -> bool {
        let Some(key) = self.e2e_keys.lock().get(&packet.source).cloned() else {
            warn!(target: "canopy::router", source = %packet.source, "no end-to-end key for source, dropping DATA");
            return false;
        };
        let Ok(plaintext) = aead_decrypt(&key, &packet.payload) else {
            warn!(target: "canopy::router", source = %packet.source, "end-to-end AEAD decryption failed");
            return false;
        };
        self.inbox.lock().push(InboxEntry {
            timestamp_secs: now_secs(),
            source_nid: packet.source,
            plaintext,
        });
        true
    }

    /// Returns a snapshot of all plaintext messages received so far.
    pub fn inbox(&self) -> Vec<InboxEntry> {
        self.inbox.lock().clone()
    }

    /// Debug/control surface (§4.10, §6): simulate a dead downlink by
    /// suppressing the heartbeat flood toward `nid`.
    pub fn block_heartbeat(&self, nid: Nid) {
        self.blocked.block(nid);
    }

    pub fn unblock_heartbeat(&self, nid: Nid) {
        self.blocked.unblock(nid);
    }

    pub fn blocked_heartbeats(&self) -> std::collections::HashSet<Nid> {
        self.blocked.snapshot()
    }

    /// Starts the periodic heartbeat broadcast loop. Runs until
    /// [`SinkDevice::shutdown`] is called.
    pub fn spawn_heartbeat_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let sink = self.clone();
        let interval = self.config.heartbeat_interval;
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            canopy_protocol::heartbeat::run_producer_loop(
                sink.heartbeat_producer.clone(),
                interval,
                shutdown_rx,
                move |sequence, payload| {
                    let sink = sink.clone();
                    tokio::spawn(async move {
                        let exclude = sink.excluded_downlink_ports();
                        if let Err(e) = sink.router.originate_heartbeat(sequence, payload, &exclude).await {
                            warn!(target: "canopy::heartbeat", error = %e, "heartbeat broadcast failed");
                        }
                    });
                },
            )
            .await;
        })
    }

    fn excluded_downlink_ports(&self) -> Vec<PortId> {
        let blocked = self.blocked.snapshot();
        self.linkmgr
            .downlinks_snapshot()
            .into_iter()
            .filter(|rec| blocked.contains(&rec.peer_nid))
            .map(|rec| rec.port)
            .collect()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
