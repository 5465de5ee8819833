//! End-to-end wiring test closing the loop the unit tests never exercise
//! together: a real mutual-authentication handshake over a loopback
//! channel, followed by a single-hop DATA send/receive on two
//! [`RouterDaemon`]s using the session keys the handshake produced.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use p521::ecdsa::{SigningKey, VerifyingKey};
use parking_lot::Mutex as PMutex;
use rand_core::OsRng;
use uuid::Uuid;

use canopy::config::Config;
use canopy::crypto::identity::NodeCredentials;
use canopy::handshake::client::run_initiator;
use canopy::handshake::server::run_responder;
use canopy::handshake::{AuthChannel, AuthError, DEFAULT_TIMEOUT};
use canopy::messages::AuthEnvelope;
use canopy::packet::{MsgType, Packet};
use canopy::router::RouterDaemon;
use canopy::transport::{LinkTransport, Neighbour, PortId, TransportError};

// --- Minimal self-signed X.509 fixtures, local to this test binary -------
//
// A small hand-rolled DER encoder, since neither `rcgen` nor
// `x509-parser`'s own verifier support P-521 (both lean on `ring`, which
// only carries ECDSA verifiers for P-256/P-384), and this crate's own
// verifier expects real ASN.1 rather than an opaque stand-in blob.

const OID_EC_PUBLIC_KEY: [u8; 9] = [0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01];
const OID_SECP521R1: [u8; 7] = [0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x23];
const OID_ECDSA_WITH_SHA256: [u8; 10] = [0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02];
const OID_COMMON_NAME: [u8; 5] = [0x06, 0x03, 0x55, 0x04, 0x03];

fn der_len(len: usize) -> Vec<u8> {
    if len < 0x80 {
        vec![len as u8]
    } else {
        let bytes = len.to_be_bytes();
        let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
        let trimmed = &bytes[first..];
        let mut out = vec![0x80 | trimmed.len() as u8];
        out.extend_from_slice(trimmed);
        out
    }
}

fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&der_len(content.len()));
    out.extend_from_slice(content);
    out
}

fn der_sequence(parts: &[&[u8]]) -> Vec<u8> {
    der_tlv(0x30, &parts.concat())
}

fn der_utf8_string(s: &str) -> Vec<u8> {
    der_tlv(0x0c, s.as_bytes())
}

fn der_utc_time(s: &str) -> Vec<u8> {
    der_tlv(0x17, s.as_bytes())
}

fn der_bit_string(content: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8];
    body.extend_from_slice(content);
    der_tlv(0x03, &body)
}

fn der_unsigned_integer(bytes: &[u8]) -> Vec<u8> {
    let mut trimmed = bytes;
    while trimmed.len() > 1 && trimmed[0] == 0 {
        trimmed = &trimmed[1..];
    }
    let mut content = Vec::new();
    if trimmed.is_empty() || trimmed[0] & 0x80 != 0 {
        content.push(0);
    }
    content.extend_from_slice(trimmed);
    der_tlv(0x02, &content)
}

fn name(cn: &str) -> Vec<u8> {
    let atv = der_sequence(&[&OID_COMMON_NAME, &der_utf8_string(cn)]);
    der_tlv(0x30, &der_tlv(0x31, &atv))
}

fn subject_public_key_info(verifying_key: &VerifyingKey) -> Vec<u8> {
    let point = verifying_key.to_encoded_point(false);
    let alg = der_sequence(&[&OID_EC_PUBLIC_KEY, &OID_SECP521R1]);
    der_sequence(&[&alg, &der_bit_string(point.as_bytes())])
}

fn encode_ecdsa_sig_value(raw_rs: &[u8]) -> Vec<u8> {
    let half = raw_rs.len() / 2;
    der_sequence(&[
        &der_unsigned_integer(&raw_rs[..half]),
        &der_unsigned_integer(&raw_rs[half..]),
    ])
}

fn build_certificate(cn: &str, subject_key: &VerifyingKey, issuer_signing_key: &SigningKey) -> Vec<u8> {
    let serial = der_unsigned_integer(&rand::random::<[u8; 8]>());
    let sig_alg = der_sequence(&[&OID_ECDSA_WITH_SHA256]);
    let issuer = name("canopy-test-ca");
    let validity = der_sequence(&[&der_utc_time("200101000000Z"), &der_utc_time("491231235959Z")]);
    let subject = name(cn);
    let spki = subject_public_key_info(subject_key);

    let tbs = der_sequence(&[&serial, &sig_alg, &issuer, &validity, &subject, &spki]);
    let raw_sig = canopy::crypto::sign(issuer_signing_key, &tbs);
    let signature = encode_ecdsa_sig_value(&raw_sig);

    der_sequence(&[&tbs, &sig_alg, &der_bit_string(&signature)])
}

/// A CA keypair plus the DER of its own self-signed certificate, issuing
/// device credentials devices authenticate with.
struct TestCa {
    der: Vec<u8>,
    signing_key: SigningKey,
}

impl TestCa {
    fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = VerifyingKey::from(&signing_key);
        let der = build_certificate("canopy-test-ca", &verifying_key, &signing_key);
        Self { der, signing_key }
    }

    fn issue(&self, nid: Uuid) -> NodeCredentials {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = VerifyingKey::from(&signing_key);
        let certificate_der = build_certificate(&nid.to_string(), &verifying_key, &self.signing_key);
        NodeCredentials {
            nid: canopy::packet::Nid::from_uuid(nid),
            is_sink: false,
            signing_key,
            verifying_key,
            certificate_der,
        }
    }
}

// --- In-memory AuthChannel, the same shape the unit tests use ------------

struct LoopbackChannel {
    outbox: Arc<Mutex<VecDeque<AuthEnvelope>>>,
    inbox: Arc<Mutex<VecDeque<AuthEnvelope>>>,
}

#[async_trait]
impl AuthChannel for LoopbackChannel {
    async fn send(&mut self, envelope: AuthEnvelope) -> Result<(), AuthError> {
        self.outbox.lock().unwrap().push_back(envelope);
        Ok(())
    }

    async fn recv(&mut self) -> Result<AuthEnvelope, AuthError> {
        for _ in 0..200 {
            if let Some(e) = self.inbox.lock().unwrap().pop_front() {
                return Ok(e);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Err(AuthError::Channel("no message".into()))
    }
}

fn loopback_pair() -> (LoopbackChannel, LoopbackChannel) {
    let a_to_b = Arc::new(Mutex::new(VecDeque::new()));
    let b_to_a = Arc::new(Mutex::new(VecDeque::new()));
    (
        LoopbackChannel { outbox: a_to_b.clone(), inbox: b_to_a.clone() },
        LoopbackChannel { outbox: b_to_a, inbox: a_to_b },
    )
}

// --- Router-facing test double -------------------------------------------

#[derive(Default)]
struct RecordingTransport {
    sent: PMutex<Vec<(PortId, Vec<u8>)>>,
}

#[async_trait]
impl LinkTransport for RecordingTransport {
    async fn send(&self, port: &PortId, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.sent.lock().push((port.clone(), bytes));
        Ok(())
    }
    async fn broadcast(&self, _bytes: Vec<u8>, _exclude: &[PortId]) -> Result<(), TransportError> {
        Ok(())
    }
    async fn scan(&self, _timeout: Duration) -> Result<Vec<Neighbour>, TransportError> {
        Ok(vec![])
    }
    async fn connect(&self, address: &str) -> Result<PortId, TransportError> {
        Ok(PortId::Downlink(address.to_string()))
    }
    async fn disconnect(&self, _port: &PortId) -> Result<(), TransportError> {
        Ok(())
    }
    async fn update_advertisement(&self, _hop_count: i16) -> Result<(), TransportError> {
        Ok(())
    }
}

#[tokio::test]
async fn handshake_over_real_certificates_feeds_a_working_router_link() {
    let ca = TestCa::generate();
    let ca_der_for_node = ca.der.clone();
    let ca_der_for_sink = ca.der.clone();
    let sink_credentials = ca.issue(Uuid::new_v4());
    let node_credentials = ca.issue(Uuid::new_v4());
    let sink_nid = sink_credentials.nid;
    let node_nid = node_credentials.nid;

    let (mut node_channel, mut sink_channel) = loopback_pair();

    // The Node dials in and authenticates as initiator; the Sink accepts
    // and authenticates as responder. Both derive the end-to-end key
    // since this link is the Node's direct uplink to the Sink.
    let node_side = tokio::spawn(async move {
        run_initiator(&node_credentials, &ca_der_for_node, &mut node_channel, DEFAULT_TIMEOUT, true).await
    });
    let sink_side = tokio::spawn(async move {
        run_responder(&sink_credentials, &ca_der_for_sink, &mut sink_channel, DEFAULT_TIMEOUT, true).await
    });

    let (node_outcome, sink_outcome) = tokio::join!(node_side, sink_side);
    let node_outcome = node_outcome.unwrap().expect("node side authenticates");
    let sink_outcome = sink_outcome.unwrap().expect("sink side authenticates");

    assert_eq!(node_outcome.peer_nid, sink_nid);
    assert!(node_outcome.peer_is_sink);
    assert_eq!(sink_outcome.peer_nid, node_nid);
    assert!(!sink_outcome.peer_is_sink);
    assert!(node_outcome.end_to_end_key.is_some());
    assert!(sink_outcome.end_to_end_key.is_some());
    // Both sides ran the same ECDH, so the per-link MAC keys match.
    assert_eq!(node_outcome.session_keys.mac_link, sink_outcome.session_keys.mac_link);

    // Wire the derived session key into a router on each side and send a
    // single-hop DATA frame from Node to Sink.
    let node_transport = Arc::new(RecordingTransport::default());
    let sink_transport = Arc::new(RecordingTransport::default());
    let config = Arc::new(Config::default());

    let node_router = RouterDaemon::new(node_nid, false, config.clone(), node_transport.clone());
    let sink_router = RouterDaemon::new(sink_nid, true, config.clone(), sink_transport.clone());

    let uplink = PortId::Uplink;
    let downlink = PortId::Downlink("node".into());
    node_router.set_session_key(uplink.clone(), node_outcome.peer_nid, node_outcome.session_keys.clone());
    node_router.set_default_route(Some(uplink));
    sink_router.set_session_key(downlink.clone(), sink_outcome.peer_nid, sink_outcome.session_keys.clone());

    let delivered = Arc::new(PMutex::new(Vec::new()));
    let delivered2 = delivered.clone();
    sink_router.register_local_handler(
        MsgType::Data,
        Arc::new(move |p: &Packet, _port: &PortId| {
            delivered2.lock().push(p.payload.clone());
            true
        }),
    );

    node_router
        .send(sink_nid, MsgType::Data, b"hello from node".to_vec(), 1)
        .await
        .expect("node can reach its uplink");

    let (sent_port, sent_bytes) = node_transport.sent.lock()[0].clone();
    assert_eq!(sent_port, PortId::Uplink);

    sink_router.receive(downlink, sent_bytes).await;

    assert_eq!(sink_router.stats().delivered_local, 1);
    assert_eq!(delivered.lock().as_slice(), &[b"hello from node".to_vec()]);
}
