//! Composition roots that wire `canopy-protocol`'s components (router,
//! link manager, heartbeat, end-to-end key hub) into the two device roles
//! the tree topology distinguishes, plus the in-memory transport used to
//! run them without a real BLE adapter.

pub mod dispatch;
pub mod mesh;
pub mod node;
pub mod sink;
#[cfg(feature = "test-support")]
pub mod testutil;

pub use mesh::{LoopbackHub, LoopbackTransport};
pub use node::{NodeDevice, NodeError};
pub use sink::{InboxEntry, SinkDevice};
#[cfg(feature = "test-support")]
pub use testutil::TestCa;
