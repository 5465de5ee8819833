//! Secure ad-hoc BLE spanning-tree mesh protocol core.
//!
//! Implements the packet/security pipeline, the mutual X.509
//! challenge/response authentication protocol, the router daemon, the
//! heartbeat protocol and link-failure detector, and the link-manager
//! state machine that ties a node into the tree. The BLE stack itself —
//! scan, advertise, GATT server/client, notifications — is consumed
//! through the abstract [`transport::LinkTransport`] trait; no concrete
//! BLE adapter lives in this crate.

pub mod config;
pub mod crypto;
pub mod e2e;
pub mod handshake;
pub mod heartbeat;
pub mod linkmgr;
pub mod messages;
pub mod packet;
pub mod replay;
pub mod router;
pub mod transport;

pub use config::Config;
pub use crypto::identity::NodeCredentials;
pub use crypto::{CryptoError, EndToEndKey, SessionKeys};
pub use e2e::E2eChannelHub;
pub use handshake::{AuthChannel, AuthError, AuthState, HandshakeOutcome};
pub use linkmgr::{LinkError, LinkManager, LinkRecord};
pub use packet::{CodecError, MsgType, Nid, Packet};
pub use replay::{ReplayOutcome, ReplayTable, ReplayWindow};
pub use router::{RouterDaemon, RouterStatsSnapshot, SendError};
pub use transport::{DeviceType, LinkTransport, Neighbour, PortId, TransportError};
