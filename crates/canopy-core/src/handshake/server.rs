//! Responder side of the mutual authentication protocol (§4.5 step 2).
//! Run by whichever side accepted an incoming connection — every
//! established link gets full mutual authentication, uplink or downlink
//! (§9, resolved open question).

use std::time::Duration;

use rand_core::{OsRng, RngCore};

use crate::crypto::identity::{verify_peer_certificate, NodeCredentials};
use crate::crypto::{derive_end_to_end_key, derive_session_keys, sign, verify, EphemeralKeyPair};
use crate::messages::AuthEnvelope;

use super::{with_timeout, AuthChannel, AuthError, HandshakeOutcome};

/// Drives the responder role to completion or failure within `timeout`.
///
/// `derive_e2e` should be `true` exactly when the connecting peer is this
/// device's end-to-end counterpart (the Sink accepting a Node's downlink,
/// or — symmetrically — never for a Node accepting another Node's
/// downlink, since intermediate Nodes never hold `K_e2e` for traffic that
/// isn't theirs).
pub async fn run_responder(
    credentials: &NodeCredentials,
    ca_der: &[u8],
    channel: &mut dyn AuthChannel,
    timeout: Duration,
    derive_e2e: bool,
) -> Result<HandshakeOutcome, AuthError> {
    with_timeout(timeout, run_responder_inner(credentials, ca_der, channel, derive_e2e)).await
}

async fn run_responder_inner(
    credentials: &NodeCredentials,
    ca_der: &[u8],
    channel: &mut dyn AuthChannel,
    derive_e2e: bool,
) -> Result<HandshakeOutcome, AuthError> {
    let (peer_cert_der, peer_eph_pub, c1) = match channel.recv().await? {
        AuthEnvelope::Open {
            certificate_der,
            ephemeral_public,
            nonce,
        } => (certificate_der, ephemeral_public, nonce),
        _ => return Err(AuthError::Channel("expected Open".into())),
    };

    let (peer_nid, peer_is_sink, peer_verifying_key) =
        verify_peer_certificate(ca_der, &peer_cert_der).map_err(|e| {
            AuthError::PeerCertInvalid(e.to_string())
        })?;

    let eph = EphemeralKeyPair::generate();
    let mut c2 = [0u8; 32];
    OsRng.fill_bytes(&mut c2);

    let mut transcript_r = Vec::with_capacity(32 + peer_eph_pub.len() + eph.public_bytes().len());
    transcript_r.extend_from_slice(&c1);
    transcript_r.extend_from_slice(&peer_eph_pub);
    transcript_r.extend_from_slice(eph.public_bytes());
    let sig_r = sign(&credentials.signing_key, &transcript_r);

    channel
        .send(AuthEnvelope::Reply {
            certificate_der: credentials.certificate_der.clone(),
            ephemeral_public: eph.public_bytes().to_vec(),
            nonce: c2,
            signature: sig_r.to_vec(),
        })
        .await?;

    let sig_i = match channel.recv().await? {
        AuthEnvelope::Finish { signature } => signature,
        _ => return Err(AuthError::Channel("expected Finish".into())),
    };

    let mut transcript_i = Vec::with_capacity(32 + eph.public_bytes().len() + peer_eph_pub.len());
    transcript_i.extend_from_slice(&c2);
    transcript_i.extend_from_slice(eph.public_bytes());
    transcript_i.extend_from_slice(&peer_eph_pub);
    if !verify(&peer_verifying_key, &transcript_i, &sig_i) {
        return Err(AuthError::SignatureMismatch);
    }

    let shared = eph.agree(&peer_eph_pub)?;
    let session_keys = derive_session_keys(&shared)?;
    let end_to_end_key = if derive_e2e {
        Some(derive_end_to_end_key(&shared)?)
    } else {
        None
    };

    Ok(HandshakeOutcome {
        peer_nid,
        peer_is_sink,
        peer_verifying_key,
        session_keys,
        end_to_end_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::collections::VecDeque;
    use async_trait::async_trait;
    use p521::ecdsa::SigningKey;
    use rand_core::OsRng as CryptoOsRng;

    /// In-memory pair of queues standing in for the dedicated control
    /// channel during tests.
    struct LoopbackChannel {
        outbox: std::sync::Arc<Mutex<VecDeque<AuthEnvelope>>>,
        inbox: std::sync::Arc<Mutex<VecDeque<AuthEnvelope>>>,
    }

    #[async_trait]
    impl AuthChannel for LoopbackChannel {
        async fn send(&mut self, envelope: AuthEnvelope) -> Result<(), AuthError> {
            self.outbox.lock().unwrap().push_back(envelope);
            Ok(())
        }

        async fn recv(&mut self) -> Result<AuthEnvelope, AuthError> {
            for _ in 0..100 {
                if let Some(e) = self.inbox.lock().unwrap().pop_front() {
                    return Ok(e);
                }
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
            Err(AuthError::Channel("no message".into()))
        }
    }

    fn loopback_pair() -> (LoopbackChannel, LoopbackChannel) {
        let a_to_b = std::sync::Arc::new(Mutex::new(VecDeque::new()));
        let b_to_a = std::sync::Arc::new(Mutex::new(VecDeque::new()));
        (
            LoopbackChannel { outbox: a_to_b.clone(), inbox: b_to_a.clone() },
            LoopbackChannel { outbox: b_to_a, inbox: a_to_b },
        )
    }

    fn self_signed_credentials(nid: uuid::Uuid, is_sink: bool) -> (NodeCredentials, Vec<u8>) {
        // Minimal self-signed-style test fixture: build with rcgen-free
        // hand-rolled DER would be excessive here, so these tests instead
        // exercise the transcript/signature logic directly against a
        // synthetic NodeCredentials value that bypasses on-disk PEM
        // loading (covered separately by crypto::identity's own tests).
        let signing_key = SigningKey::random(&mut CryptoOsRng);
        let verifying_key = p521::ecdsa::VerifyingKey::from(&signing_key);
        let certificate_der = test_support::build_self_signed_cert(&signing_key, nid, is_sink);
        (
            NodeCredentials {
                nid: crate::packet::Nid::from_uuid(nid),
                is_sink,
                signing_key,
                verifying_key,
                certificate_der: certificate_der.clone(),
            },
            certificate_der,
        )
    }

    mod test_support {
        //! Builds throwaway self-signed certificates for handshake tests
        //! without shelling out to an external CA tool (which spec.md §1
        //! treats as an offline, external process).
        use p521::ecdsa::SigningKey;

        pub fn build_self_signed_cert(_signing_key: &SigningKey, nid: uuid::Uuid, is_sink: bool) -> Vec<u8> {
            // A real certificate requires an ASN.1 DER encoder the test
            // harness doesn't otherwise need; the handshake's certificate
            // field is treated as opaque bytes by `AuthChannel`, so tests
            // that only exercise transcript signing/verification (not
            // `verify_peer_certificate`'s X.509 parsing) can stand in a
            // fixed marker blob keyed by NID/role instead.
            let mut blob = nid.as_bytes().to_vec();
            blob.push(if is_sink { 1 } else { 0 });
            blob
        }
    }

    #[tokio::test]
    async fn handshake_transcript_signatures_are_mutually_verifiable() {
        // This test exercises the signature/transcript algebra directly
        // (the same byte layout `run_initiator`/`run_responder` build)
        // rather than routing through `verify_peer_certificate`, since
        // that requires real X.509 DER fixtures exercised in
        // `crypto::identity`'s own test module.
        let (initiator, _) = self_signed_credentials(uuid::Uuid::new_v4(), false);
        let (responder, _) = self_signed_credentials(uuid::Uuid::new_v4(), true);

        let eph_i = EphemeralKeyPair::generate();
        let eph_r = EphemeralKeyPair::generate();
        let mut c1 = [1u8; 32];
        let mut c2 = [2u8; 32];
        OsRng.fill_bytes(&mut c1);
        OsRng.fill_bytes(&mut c2);

        let mut transcript_r = Vec::new();
        transcript_r.extend_from_slice(&c1);
        transcript_r.extend_from_slice(eph_i.public_bytes());
        transcript_r.extend_from_slice(eph_r.public_bytes());
        let sig_r = sign(&responder.signing_key, &transcript_r);
        assert!(verify(&responder.verifying_key, &transcript_r, &sig_r));

        let mut transcript_i = Vec::new();
        transcript_i.extend_from_slice(&c2);
        transcript_i.extend_from_slice(eph_r.public_bytes());
        transcript_i.extend_from_slice(eph_i.public_bytes());
        let sig_i = sign(&initiator.signing_key, &transcript_i);
        assert!(verify(&initiator.verifying_key, &transcript_i, &sig_i));

        let za = eph_i.agree(eph_r.public_bytes()).unwrap();
        let zb = eph_r.agree(eph_i.public_bytes()).unwrap();
        assert_eq!(za, zb);
    }

    #[tokio::test]
    async fn loopback_channel_delivers_in_order() {
        let (mut a, mut b) = loopback_pair();
        a.send(AuthEnvelope::Finish { signature: vec![1] }).await.unwrap();
        match b.recv().await.unwrap() {
            AuthEnvelope::Finish { signature } => assert_eq!(signature, vec![1]),
            _ => panic!("wrong variant"),
        }
    }
}
