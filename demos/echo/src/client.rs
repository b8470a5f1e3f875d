//! Echo client loop.

use std::time::Duration;

use kcp_transport::prelude::*;
use tracing::{info, warn};

use crate::DemoError;

const PING_INTERVAL: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Connect, ping `pings` times (forever when `0`), then leave.
pub async fn run(config: ClientConfig, host: &str, port: u16, pings: u32) -> Result<(), DemoError> {
    let mut client = KcpClient::new(config);
    client.connect(host, port).await?;
    info!("connecting to {}:{}", host, port);

    let mut sent = 0u32;
    let mut replies = 0u32;
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    let mut ping = tokio::time::interval(PING_INTERVAL);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ping.tick() => {
                if pings != 0 && sent == pings {
                    continue;
                }
                match client.send(b"PING") {
                    Ok(_) => sent += 1,
                    Err(e) => warn!("ping not sent: {}", e),
                }
            }
            _ = poll.tick() => {}
        }

        while let Some(event) = client.receive() {
            match event {
                TransportEvent::Connect { connection_id, endpoint } => {
                    info!("connected as {} via {}", connection_id, endpoint);
                }
                TransportEvent::Data { payload, .. } => {
                    replies += 1;
                    info!("reply {}: {}", replies, String::from_utf8_lossy(&payload));
                }
                TransportEvent::Disconnect { .. } => info!("server closed the connection"),
                TransportEvent::Error { fault, .. } => warn!("socket error: {}", fault),
            }
        }

        if !client.is_started() || (pings != 0 && replies >= pings) {
            break;
        }
    }

    client.stop().await;
    info!("sent {}, received {}", sent, replies);
    Ok(())
}
