//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use kcp_transport::prelude::*;
use tracing::Level;

pub const TIMEOUT: Duration = Duration::from_secs(5);

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

pub fn server_config(max_connections: usize) -> ServerConfig {
    ServerConfigBuilder::new()
        .bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .max_connections(max_connections)
        .engine(EngineSettings::turbo())
        .update_interval(Duration::from_millis(5))
        .build()
}

pub fn client_config(handshake: HandshakeMode) -> ClientConfig {
    ClientConfigBuilder::new()
        .handshake(handshake)
        .engine(EngineSettings::turbo())
        .hello_interval(Duration::from_millis(20))
        .update_interval(Duration::from_millis(5))
        .build()
}

pub async fn started_server(max_connections: usize) -> KcpServer {
    let mut server = KcpServer::new(server_config(max_connections));
    server.start().await.expect("server starts");
    server
}

/// Poll until an event of `kind` shows up, dropping everything before it.
///
/// `pump` runs once per round so the other end keeps processing datagrams (and acknowledging
/// ours) while this one is waited on.
pub async fn wait_for<F, P>(mut poll: F, mut pump: P, kind: EventKind) -> TransportEvent
where
    F: FnMut() -> Option<TransportEvent>,
    P: FnMut(),
{
    let deadline = Instant::now() + TIMEOUT;
    loop {
        pump();
        while let Some(event) = poll() {
            if event.kind() == kind {
                return event;
            }
        }
        assert!(Instant::now() < deadline, "timed out waiting for {kind:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Collect every event produced during `window`, pumping the other end meanwhile.
pub async fn drain_for<F, P>(mut poll: F, mut pump: P, window: Duration) -> Vec<TransportEvent>
where
    F: FnMut() -> Option<TransportEvent>,
    P: FnMut(),
{
    let deadline = Instant::now() + window;
    let mut events = Vec::new();
    while Instant::now() < deadline {
        pump();
        events.extend(std::iter::from_fn(&mut poll));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    events
}

/// Nothing to pump: the other end is gone or not ours.
pub fn idle() {}

/// Wait until the client holds a connected id, keeping the server polled.
pub async fn wait_connected(client: &mut KcpClient, server: &mut KcpServer) -> ConnectionId {
    wait_for(|| client.receive(), || server.poll(), EventKind::Connect).await;
    let deadline = Instant::now() + TIMEOUT;
    while !client.is_connected() {
        assert!(Instant::now() < deadline, "client never connected");
        server.poll();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    client.connection_id().expect("bound client has an id")
}
