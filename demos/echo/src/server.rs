//! Echo server loop.

use std::time::Duration;

use kcp_transport::prelude::*;
use tracing::{info, warn};

use crate::DemoError;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Reply for one payload.
pub fn reply(payload: &[u8]) -> Vec<u8> {
    payload.to_ascii_lowercase()
}

/// Serve until Ctrl-C.
pub async fn run(config: ServerConfig) -> Result<(), DemoError> {
    let mut server = KcpServer::new(config);
    server.start().await?;
    info!(
        "echo server on {:?}, control {:?}",
        server.local_addr(),
        server.control_addr()
    );

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {}
        }
        while let Some(event) = server.receive() {
            match event {
                TransportEvent::Connect { connection_id, endpoint } => {
                    info!("{} joined from {} ({} online)", connection_id, endpoint, server.connection_count());
                }
                TransportEvent::Data { connection_id, payload, .. } => {
                    if let Err(e) = server.send(connection_id, &reply(&payload)) {
                        warn!("reply to {} failed: {}", connection_id, e);
                    }
                }
                TransportEvent::Disconnect { connection_id, .. } => {
                    info!("{} left", connection_id);
                }
                TransportEvent::Error { endpoint, fault } => {
                    warn!("socket error ({:?}): {}", endpoint, fault);
                }
            }
        }
    }

    server.stop().await;
    info!("echo server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_lowercases() {
        assert_eq!(reply(b"PING"), b"ping");
        assert_eq!(reply(b"already"), b"already");
        assert!(reply(b"").is_empty());
    }
}
