//! Crypto primitives: ECDSA-P521 sign/verify, ECDH key agreement with
//! HKDF-SHA256 expansion, HMAC-SHA256, and AES-256-GCM AEAD.
//!
//! Every key type that should not outlive its link or session implements
//! `Zeroize`/`ZeroizeOnDrop` so the compiler enforces "destroyed on
//! disconnect" rather than relying on callers to remember to clear
//! buffers.

pub mod identity;

use aes_gcm::aead::{Aead, KeyInit, OsRng as AesOsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p521::ecdsa::signature::{DigestSigner, DigestVerifier};
use p521::ecdsa::{Signature, SigningKey, VerifyingKey};
use p521::elliptic_curve::rand_core::RngCore;
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Info label binding an HKDF expansion to the per-link MAC key.
pub const INFO_MAC_LINK: &[u8] = b"mac-link";
/// Info label binding an HKDF expansion to the end-to-end AEAD key.
pub const INFO_E2E: &[u8] = b"e2e";

/// Width, in bytes, of a raw (non-DER) P-521 ECDSA signature: two
/// 66-byte field elements concatenated as `r || s`. See SPEC_FULL.md §E.1
/// for why raw encoding was chosen over DER.
pub const ECDSA_P521_RAW_SIG_LEN: usize = 132;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("key agreement failed: {0}")]
    KeyAgreementFailed(String),
}

/// 32-byte per-link MAC key, installed atomically after a successful
/// mutual authentication and destroyed on disconnect.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub mac_link: [u8; 32],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").field("mac_link", &"<redacted>").finish()
    }
}

/// 32-byte end-to-end AEAD key, held only at the two tree endpoints.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EndToEndKey(pub [u8; 32]);

impl std::fmt::Debug for EndToEndKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EndToEndKey").field(&"<redacted>").finish()
    }
}

/// An ephemeral P-521 ECDH keypair, consumed exactly once by the
/// authentication state machine.
#[derive(ZeroizeOnDrop)]
pub struct EphemeralKeyPair {
    #[zeroize(skip)]
    public_bytes: Vec<u8>,
    secret: p521::SecretKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = p521::SecretKey::random(&mut OsRng);
        let public_bytes = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
        Self { public_bytes, secret }
    }

    pub fn public_bytes(&self) -> &[u8] {
        &self.public_bytes
    }

    /// Computes `z = ECDH(self, peer_public)` and expands it via HKDF-SHA256
    /// into both the link-MAC key and (optionally) the end-to-end key.
    pub fn agree(&self, peer_public_bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
        let peer_public = p521::PublicKey::from_sec1_bytes(peer_public_bytes)
            .map_err(|e| CryptoError::KeyAgreementFailed(e.to_string()))?;
        let shared = p521::elliptic_curve::ecdh::diffie_hellman(
            self.secret.to_nonzero_scalar(),
            peer_public.as_affine(),
        );
        let mut z = [0u8; 66];
        z.copy_from_slice(shared.raw_secret_bytes());
        let mut out = [0u8; 32];
        let hk = Hkdf::<Sha256>::new(None, &z);
        hk.expand(&[], &mut out)
            .map_err(|e| CryptoError::KeyAgreementFailed(e.to_string()))?;
        z.zeroize();
        Ok(out)
    }
}

/// Derives the per-link MAC key from a raw ECDH shared-secret-derived seed.
pub fn derive_session_keys(shared_secret: &[u8; 32]) -> Result<SessionKeys, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut mac_link = [0u8; 32];
    hk.expand(INFO_MAC_LINK, &mut mac_link)
        .map_err(|e| CryptoError::KeyAgreementFailed(e.to_string()))?;
    Ok(SessionKeys { mac_link })
}

/// Derives the end-to-end AEAD key, domain-separated from the link key.
/// Only ever called by the two tree endpoints for their shared traffic.
pub fn derive_end_to_end_key(shared_secret: &[u8; 32]) -> Result<EndToEndKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hk.expand(INFO_E2E, &mut key)
        .map_err(|e| CryptoError::KeyAgreementFailed(e.to_string()))?;
    Ok(EndToEndKey(key))
}

/// Computes HMAC-SHA256 over `data` keyed by `key`.
pub fn compute_mac(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Verifies an HMAC-SHA256 tag in constant time.
pub fn verify_mac(key: &[u8; 32], data: &[u8], tag: &[u8; 32]) -> bool {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}

/// AES-256-GCM encrypt. Output is `nonce(12) || ciphertext || tag(16)`.
pub fn aead_encrypt(key: &EndToEndKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| CryptoError::KeyAgreementFailed(e.to_string()))?;
    let mut nonce_bytes = [0u8; 12];
    AesOsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// AES-256-GCM decrypt. Returns `DecryptionFailed` (never partial
/// plaintext) on any tampering of nonce, ciphertext, or tag.
pub fn aead_decrypt(key: &EndToEndKey, wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if wire.len() < 12 + 16 {
        return Err(CryptoError::DecryptionFailed);
    }
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| CryptoError::KeyAgreementFailed(e.to_string()))?;
    let (nonce_bytes, ciphertext) = wire.split_at(12);
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad: &[] })
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Signs `message` with an ECDSA-P521 private key over SHA-256 (§4.1 pairs
/// the scheme with SHA-256, the same hash used for HMAC and HKDF
/// throughout this crate), raw `r || s` encoding.
pub fn sign(signing_key: &SigningKey, message: &[u8]) -> [u8; ECDSA_P521_RAW_SIG_LEN] {
    let digest = Sha256::new_with_prefix(message);
    let sig: Signature = signing_key.sign_digest(digest);
    let mut out = [0u8; ECDSA_P521_RAW_SIG_LEN];
    out.copy_from_slice(sig.to_bytes().as_slice());
    out
}

/// Verifies a raw `r || s` ECDSA-P521 signature computed over SHA-256.
pub fn verify(verifying_key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    let digest = Sha256::new_with_prefix(message);
    verifying_key.verify_digest(digest, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_round_trips_and_rejects_tamper() {
        let key = [7u8; 32];
        let mac = compute_mac(&key, b"payload");
        assert!(verify_mac(&key, b"payload", &mac));
        assert!(!verify_mac(&key, b"payload!", &mac));
        let wrong_key = [8u8; 32];
        assert!(!verify_mac(&wrong_key, b"payload", &mac));
    }

    #[test]
    fn aead_round_trip_and_bitflip_rejection() {
        let key = EndToEndKey([9u8; 32]);
        let wrapped = aead_encrypt(&key, b"hello").unwrap();
        let opened = aead_decrypt(&key, &wrapped).unwrap();
        assert_eq!(opened, b"hello");

        let mut tampered = wrapped.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(aead_decrypt(&key, &tampered).is_err());
    }

    #[test]
    fn ecdh_is_symmetric_between_two_ephemeral_parties() {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();
        let za = a.agree(b.public_bytes()).unwrap();
        let zb = b.agree(a.public_bytes()).unwrap();
        assert_eq!(za, zb);

        let keys_a = derive_session_keys(&za).unwrap();
        let keys_b = derive_session_keys(&zb).unwrap();
        assert_eq!(keys_a.mac_link, keys_b.mac_link);
    }

    #[test]
    fn link_and_e2e_keys_are_domain_separated() {
        let shared = [3u8; 32];
        let link = derive_session_keys(&shared).unwrap();
        let e2e = derive_end_to_end_key(&shared).unwrap();
        assert_ne!(link.mac_link, e2e.0);
    }

    #[test]
    fn ecdsa_sign_verify_round_trip_raw_signature() {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = VerifyingKey::from(&signing_key);
        let sig = sign(&signing_key, b"sink_nid||timestamp||sequence");
        assert_eq!(sig.len(), ECDSA_P521_RAW_SIG_LEN);
        assert!(verify(&verifying_key, b"sink_nid||timestamp||sequence", &sig));
        assert!(!verify(&verifying_key, b"tampered", &sig));
    }
}
