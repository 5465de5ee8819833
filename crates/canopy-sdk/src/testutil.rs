//! Minimal self-signed X.509 fixtures for tests and demos, standing in for
//! the CA tooling spec.md §2 puts out of scope. Builds just enough DER
//! (no v3 extensions, since `canopy_protocol::crypto::identity` never reads
//! any) to produce certificates `x509-parser` accepts and this crate's own
//! ECDSA-P521 verifier can check.
//!
//! Gated behind the `test-support` feature, the same shape as tokio's own
//! `test-util` feature this workspace already depends on.

use canopy_protocol::crypto::identity::NodeCredentials;
use canopy_protocol::crypto::ECDSA_P521_RAW_SIG_LEN;
use canopy_protocol::packet::Nid;
use p521::ecdsa::{SigningKey, VerifyingKey};
use rand_core::OsRng;
use uuid::Uuid;

const OID_EC_PUBLIC_KEY: [u8; 9] = [0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01];
const OID_SECP521R1: [u8; 7] = [0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x23];
const OID_ECDSA_WITH_SHA256: [u8; 10] = [0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02];
const OID_COMMON_NAME: [u8; 5] = [0x06, 0x03, 0x55, 0x04, 0x03];
const OID_ORGANIZATIONAL_UNIT: [u8; 5] = [0x06, 0x03, 0x55, 0x04, 0x0b];

fn der_len(len: usize) -> Vec<u8> {
    if len < 0x80 {
        vec![len as u8]
    } else {
        let bytes = len.to_be_bytes();
        let first_significant = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
        let trimmed = &bytes[first_significant..];
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

/// DER `INTEGER` from an unsigned big-endian value, trimming redundant
/// leading zero bytes and re-adding the single sign-guard byte DER requires
/// when the high bit of the first remaining byte is set.
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

fn rdn(oid: &[u8], value: &str) -> Vec<u8> {
    let atv = der_sequence(&[oid, &der_utf8_string(value)]);
    der_tlv(0x31, &atv)
}

fn name(cn: &str, ou: Option<&str>) -> Vec<u8> {
    let mut rdns = Vec::new();
    if let Some(ou) = ou {
        rdns.extend(rdn(&OID_ORGANIZATIONAL_UNIT, ou));
    }
    rdns.extend(rdn(&OID_COMMON_NAME, cn));
    der_tlv(0x30, &rdns)
}

fn subject_public_key_info(verifying_key: &VerifyingKey) -> Vec<u8> {
    let point = verifying_key.to_encoded_point(false);
    let alg = der_sequence(&[&OID_EC_PUBLIC_KEY, &OID_SECP521R1]);
    der_sequence(&[&alg, &der_bit_string(point.as_bytes())])
}

fn encode_ecdsa_sig_value(raw_rs: &[u8; ECDSA_P521_RAW_SIG_LEN]) -> Vec<u8> {
    let half = ECDSA_P521_RAW_SIG_LEN / 2;
    der_sequence(&[
        &der_unsigned_integer(&raw_rs[..half]),
        &der_unsigned_integer(&raw_rs[half..]),
    ])
}

/// Builds a self-signed X.509 certificate (no extensions) for `cn`/`ou` and
/// signs it with `signing_key` (the issuer's — equal to `subject_key` when
/// the certificate is the CA's own trust anchor).
fn build_certificate(
    cn: &str,
    ou: Option<&str>,
    subject_key: &VerifyingKey,
    issuer_signing_key: &SigningKey,
) -> Vec<u8> {
    let serial = der_unsigned_integer(&rand::random::<[u8; 8]>());
    let sig_alg = der_sequence(&[&OID_ECDSA_WITH_SHA256]);
    // CA and device share one flat namespace here; real deployments would
    // give the CA its own distinct Name, but nothing in `identity.rs` reads
    // the issuer field, so reusing `name()` for both keeps this small.
    let issuer = name("canopy-ca", None);
    let validity = der_sequence(&[&der_utc_time("200101000000Z"), &der_utc_time("491231235959Z")]);
    let subject = name(cn, ou);
    let spki = subject_public_key_info(subject_key);

    let tbs = der_sequence(&[&serial, &sig_alg, &issuer, &validity, &subject, &spki]);
    let raw_sig = canopy_protocol::crypto::sign(issuer_signing_key, &tbs);
    let signature = encode_ecdsa_sig_value(&raw_sig);

    der_sequence(&[&tbs, &sig_alg, &der_bit_string(&signature)])
}

/// A CA keypair plus the self-signed certificate devices are issued
/// against.
pub struct TestCa {
    pub der: Vec<u8>,
    signing_key: SigningKey,
}

impl TestCa {
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = VerifyingKey::from(&signing_key);
        let der = build_certificate("canopy-ca", None, &verifying_key, &signing_key);
        Self { der, signing_key }
    }

    /// Issues device credentials signed by this CA. `nid` defaults to a
    /// fresh random UUID when `None`.
    pub fn issue(&self, nid: Option<Uuid>, is_sink: bool) -> NodeCredentials {
        let nid = nid.unwrap_or_else(Uuid::new_v4);
        let device_signing_key = SigningKey::random(&mut OsRng);
        let device_verifying_key = VerifyingKey::from(&device_signing_key);
        let ou = is_sink.then_some(canopy_protocol::crypto::identity::SINK_OU_MARKER);
        let certificate_der = build_certificate(
            &nid.to_string(),
            ou,
            &device_verifying_key,
            &self.signing_key,
        );
        NodeCredentials {
            nid: Nid::from_uuid(nid),
            is_sink,
            signing_key: device_signing_key,
            verifying_key: device_verifying_key,
            certificate_der,
        }
    }
}
