//! kcp-transport echo demo.
//!
//! The server answers every payload with its ASCII-lowercased copy (`PING` -> `ping`).
//! The client connects, sends `PING` at a fixed cadence and logs the replies.
//!
//! Environment variables:
//! - KCP_MODE: "server" or "client"
//! - KCP_PORT: Server port (default 5555)
//! - KCP_MAX_CONNECTIONS: Server connection limit (default 100)
//! - KCP_SERVER_HOST: Server hostname (client only, default localhost)
//! - KCP_PINGS: Number of pings the client sends, 0 for unbounded (default 5)
//! - KCP_HANDSHAKE: "stream" or "datagram" (client only, default stream)
//! - KCP_ENGINE_SETTINGS: JSON object overriding engine settings, e.g. `{"enable_no_delay":true}`
//! - KCP_LOG_LEVEL: trace|debug|info|warn|error

mod client;
mod server;

use std::env;
use std::str::FromStr;

use kcp_transport::prelude::*;
use tracing_subscriber::EnvFilter;

/// Demo failure.
#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid {name}: {value}")]
    InvalidVar { name: &'static str, value: String },

    #[error("invalid KCP_ENGINE_SETTINGS: {0}")]
    EngineSettings(#[from] serde_json::Error),
}

fn var_or<T: FromStr>(name: &'static str, default: T) -> Result<T, DemoError> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| DemoError::InvalidVar { name, value }),
        Err(_) => Ok(default),
    }
}

fn engine_settings() -> Result<EngineSettings, DemoError> {
    match env::var("KCP_ENGINE_SETTINGS") {
        Ok(json) => Ok(serde_json::from_str(&json)?),
        Err(_) => Ok(EngineSettings::default()),
    }
}

fn handshake_mode() -> Result<HandshakeMode, DemoError> {
    match env::var("KCP_HANDSHAKE").as_deref() {
        Err(_) | Ok("stream") => Ok(HandshakeMode::Stream),
        Ok("datagram") => Ok(HandshakeMode::Datagram),
        Ok(other) => Err(DemoError::InvalidVar {
            name: "KCP_HANDSHAKE",
            value: other.to_string(),
        }),
    }
}

async fn run() -> Result<(), DemoError> {
    let port: u16 = var_or("KCP_PORT", 5555)?;
    let engine = engine_settings()?;

    match env::var("KCP_MODE").as_deref() {
        Ok("server") => {
            let max_connections = var_or("KCP_MAX_CONNECTIONS", 100usize)?;
            let config = ServerConfigBuilder::new()
                .port(port)
                .max_connections(max_connections)
                .engine(engine)
                .build();
            server::run(config).await
        }
        Ok("client") => {
            let host = env::var("KCP_SERVER_HOST").unwrap_or_else(|_| "localhost".to_string());
            let pings = var_or("KCP_PINGS", 5u32)?;
            let config = ClientConfigBuilder::new()
                .handshake(handshake_mode()?)
                .engine(engine)
                .build();
            client::run(config, &host, port, pings).await
        }
        other => Err(DemoError::InvalidVar {
            name: "KCP_MODE",
            value: other.unwrap_or("<unset>").to_string(),
        }),
    }
}

#[tokio::main]
async fn main() {
    let level = env::var("KCP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}
