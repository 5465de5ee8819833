//! Mutual X.509 challenge/response authentication (§4.5).
//!
//! Roles are symmetric in shape (both sides send a certificate, an
//! ephemeral ECDH public key, and a nonce) but asymmetric in sequencing:
//! the initiator opens, the responder replies with a signature over the
//! transcript so far, and the initiator closes with its own signature.
//! Initiator and responder are separate modules, each driving a shared
//! [`AuthState`] machine over an injected channel trait.

pub mod client;
pub mod server;

use std::time::Duration;

use async_trait::async_trait;
use p521::ecdsa::VerifyingKey;
use thiserror::Error;

use crate::crypto::{CryptoError, EndToEndKey, SessionKeys};
use crate::messages::AuthEnvelope;
use crate::packet::Nid;

/// Authentication session states, per §3 "Authentication session state".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    CertSent,
    ChallengeSent,
    ChallengeResponded,
    Authenticated,
    Failed,
}

#[derive(Debug, Error, Clone)]
pub enum AuthError {
    #[error("peer certificate invalid: {0}")]
    PeerCertInvalid(String),
    #[error("peer certificate expired or not yet valid")]
    PeerCertExpired,
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("authentication timed out")]
    Timeout,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("channel error: {0}")]
    Channel(String),
}

/// The dedicated control channel the authentication messages travel over.
/// Concrete transports (built on [`crate::transport::LinkTransport`]) wrap
/// AUTH_REQUEST/AUTH_RESPONSE packet payloads behind this narrow trait so
/// the state machine itself stays transport-agnostic, same seam as the
/// teacher's `HandshakeTransport`.
#[async_trait]
pub trait AuthChannel: Send {
    async fn send(&mut self, envelope: AuthEnvelope) -> Result<(), AuthError>;
    async fn recv(&mut self) -> Result<AuthEnvelope, AuthError>;
}

/// Everything a successful handshake produces: the per-link MAC key, the
/// peer's identity, and — only when the peer is the Sink or we are the
/// Sink talking to this peer's eventual traffic source — the end-to-end
/// AEAD key. Per spec.md §9's resolved open question, intermediate Nodes
/// never derive `e2e` for traffic that isn't theirs; whether to derive it
/// here is the caller's decision (see `derive_e2e` parameter on
/// `run_initiator`/`run_responder`), not something inferred from role.
pub struct HandshakeOutcome {
    pub peer_nid: Nid,
    pub peer_is_sink: bool,
    pub peer_verifying_key: VerifyingKey,
    pub session_keys: SessionKeys,
    pub end_to_end_key: Option<EndToEndKey>,
}

/// Default end-to-end authentication deadline (§4.5, §6).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, AuthError>>,
) -> Result<T, AuthError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| AuthError::Timeout)?
}
