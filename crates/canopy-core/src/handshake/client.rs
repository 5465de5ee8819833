//! Initiator side of the mutual authentication protocol (§4.5 steps 1, 3).
//! The initiator is whichever side first writes AUTH_REQUEST after
//! connection is established — in practice, the Node that dialed in.

use std::time::Duration;

use rand_core::{OsRng, RngCore};

use crate::crypto::identity::{verify_peer_certificate, NodeCredentials};
use crate::crypto::{derive_end_to_end_key, derive_session_keys, sign, verify, EphemeralKeyPair};
use crate::messages::AuthEnvelope;

use super::{with_timeout, AuthChannel, AuthError, HandshakeOutcome};

/// Drives the initiator role to completion or failure within `timeout`.
///
/// `derive_e2e` should be `true` exactly when this link is the
/// authenticating Node's uplink toward the Sink (or the Sink itself is
/// the peer) — the only place the end-to-end key is needed.
pub async fn run_initiator(
    credentials: &NodeCredentials,
    ca_der: &[u8],
    channel: &mut dyn AuthChannel,
    timeout: Duration,
    derive_e2e: bool,
) -> Result<HandshakeOutcome, AuthError> {
    with_timeout(timeout, run_initiator_inner(credentials, ca_der, channel, derive_e2e)).await
}

async fn run_initiator_inner(
    credentials: &NodeCredentials,
    ca_der: &[u8],
    channel: &mut dyn AuthChannel,
    derive_e2e: bool,
) -> Result<HandshakeOutcome, AuthError> {
    let eph = EphemeralKeyPair::generate();
    let mut c1 = [0u8; 32];
    OsRng.fill_bytes(&mut c1);

    channel
        .send(AuthEnvelope::Open {
            certificate_der: credentials.certificate_der.clone(),
            ephemeral_public: eph.public_bytes().to_vec(),
            nonce: c1,
        })
        .await?;

    let (peer_cert_der, peer_eph_pub, c2, sig_r) = match channel.recv().await? {
        AuthEnvelope::Reply {
            certificate_der,
            ephemeral_public,
            nonce,
            signature,
        } => (certificate_der, ephemeral_public, nonce, signature),
        _ => return Err(AuthError::Channel("expected Reply".into())),
    };

    let (peer_nid, peer_is_sink, peer_verifying_key) =
        verify_peer_certificate(ca_der, &peer_cert_der).map_err(|e| {
            AuthError::PeerCertInvalid(e.to_string())
        })?;

    let mut transcript_r = Vec::with_capacity(32 + eph.public_bytes().len() + peer_eph_pub.len());
    transcript_r.extend_from_slice(&c1);
    transcript_r.extend_from_slice(eph.public_bytes());
    transcript_r.extend_from_slice(&peer_eph_pub);
    if !verify(&peer_verifying_key, &transcript_r, &sig_r) {
        return Err(AuthError::SignatureMismatch);
    }

    let mut transcript_i = Vec::with_capacity(32 + peer_eph_pub.len() + eph.public_bytes().len());
    transcript_i.extend_from_slice(&c2);
    transcript_i.extend_from_slice(&peer_eph_pub);
    transcript_i.extend_from_slice(eph.public_bytes());
    let sig_i = sign(&credentials.signing_key, &transcript_i);

    channel
        .send(AuthEnvelope::Finish {
            signature: sig_i.to_vec(),
        })
        .await?;

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
