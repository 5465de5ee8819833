//! Minimal end-to-end demo: one Sink and one Node sharing a
//! [`LoopbackHub`], authenticating, and exchanging a DATA message over the
//! end-to-end AEAD channel. Run with `cargo run -p canopy-sdk --example
//! basic --features test-support`.

use std::sync::Arc;
use std::time::Duration;

use canopy_protocol::transport::DeviceType;
use canopy_protocol::Config;
use canopy_sdk::{LoopbackHub, LoopbackTransport, NodeDevice, SinkDevice, TestCa};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let ca = TestCa::generate();
    let hub = LoopbackHub::new();

    let sink_transport = LoopbackTransport::new("sink", DeviceType::Sink, hub.clone());
    let sink = SinkDevice::new(ca.issue(None, true), ca.der.clone(), Config::default(), sink_transport);
    sink.clone().spawn_heartbeat_loop();

    let node_transport = LoopbackTransport::new("node-1", DeviceType::Node, hub.clone());
    let node = NodeDevice::new(ca.issue(None, false), ca.der.clone(), Config::default(), node_transport);
    node.connect_uplink().await?;
    node.spawn_watchdog_loop();

    // The end-to-end key is available immediately since the Sink is this
    // Node's direct uplink; for a multi-hop Node it arrives a little later,
    // once the Sink learns of it via a heartbeat and the two bootstrap a
    // routed handshake (see `NodeDevice::try_bootstrap_end_to_end`).
    tokio::time::sleep(Duration::from_millis(50)).await;
    node.send_message(b"hello from node-1".to_vec()).await?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    for entry in sink.inbox() {
        println!("sink received from {}: {}", entry.source_nid, String::from_utf8_lossy(&entry.plaintext));
    }

    node.shutdown();
    sink.shutdown();
    Ok(())
}
