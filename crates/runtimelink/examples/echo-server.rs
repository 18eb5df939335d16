//! Minimal echo server: publishes a loopback port file and echoes strings.
//!
//! Run with:
//!   cargo run --example echo-server
//!
//! In another terminal:
//!   cargo run --features cli -- send --transport loopback \
//!     --identifier echo-example --name echo --data hello --wait

use std::time::Duration;

use runtimelink::peer::{PortDiscovery, Server, ServerConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::default();
    config.handlers.register("echo", |text: String| {
        eprintln!("Received {} bytes", text.len());
        Ok(text)
    });

    let discovery = PortDiscovery::default();
    let server = Server::loopback_discoverable("echo-example", &discovery, config)?;
    eprintln!(
        "Listening on 127.0.0.1:{} (port file {})",
        server.port(),
        discovery.path_for("echo-example")?.display()
    );

    // Serve the first peer until it disconnects.
    let peer = server.wait_for_peer(Duration::from_secs(300))?;
    eprintln!("Peer connected: {}", peer.transport_name());
    while !peer.wait_stopped(Duration::from_secs(1)) {}
    eprintln!(
        "Peer disconnected: {}",
        peer.stop_reason().unwrap_or_default()
    );

    server.stop();
    Ok(())
}
