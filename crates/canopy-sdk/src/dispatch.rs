//! Shared inbound-frame dispatch used by both composition roots.
//!
//! AUTH_REQUEST/AUTH_RESPONSE frames travel on a per-link control channel
//! that never touches the router's MAC-gated pipeline (see
//! `LinkManager::handle_inbound_control` and DESIGN.md for why); every
//! other message type goes through `RouterDaemon::receive`. Both are
//! distinguished here by peeking the `msg_type` byte at a fixed header
//! offset rather than doing a full decode twice.

use std::sync::Arc;

use canopy_protocol::linkmgr::LinkManager;
use canopy_protocol::router::RouterDaemon;
use canopy_protocol::transport::PortId;

use crate::mesh::LoopbackTransport;

/// Byte offset of the `msg_type` field in the fixed packet header.
const MSG_TYPE_OFFSET: usize = 32;
const AUTH_REQUEST: u8 = 0x04;
const AUTH_RESPONSE: u8 = 0x05;

pub fn install_dispatcher(transport: &Arc<LoopbackTransport>, linkmgr: &Arc<LinkManager>, router: &Arc<RouterDaemon>) {
    let linkmgr = linkmgr.clone();
    let router = router.clone();
    transport.set_inbound_handler(Arc::new(move |port: PortId, bytes: Vec<u8>| {
        match bytes.get(MSG_TYPE_OFFSET) {
            Some(&AUTH_REQUEST) | Some(&AUTH_RESPONSE) => {
                linkmgr.handle_inbound_control(port, bytes);
            }
            _ => {
                let router = router.clone();
                tokio::spawn(async move {
                    router.receive(port, bytes).await;
                });
            }
        }
    }));
}
