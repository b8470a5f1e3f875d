//! # kcp-transport
//!
//! Many reliable, ordered logical connections multiplexed over one shared UDP socket.
//!
//! Every datagram carries a 4-byte connection id ahead of the bytes produced by that
//! connection's ARQ engine (KCP by default). A TCP control stream hands each client its id and
//! doubles as a liveness signal. Consumers poll a non-blocking event queue for Connect, Data,
//! Disconnect and Error events.
//!
//! ## Modules
//!
//! - [`core`]: Engine and sink traits, constants, and error types
//! - [`transport`]: Framing, connection registry, demultiplexer, tick driver, event queue
//! - [`server`]: [`KcpServer`](server::KcpServer), accepting many peers
//! - [`client`]: [`KcpClient`](client::KcpClient), holding one connection
//! - [`layer`]: [`KcpTransport`](layer::KcpTransport), the boolean facade for host frameworks
//!
//! ## Example Usage
//!
//! ```no_run
//! use kcp_transport::prelude::*;
//!
//! # async fn run() -> Result<(), TransportError> {
//! let mut server = KcpServer::new(ServerConfigBuilder::new().port(5555).build());
//! server.start().await?;
//!
//! let mut client = KcpClient::new(ClientConfig::default());
//! client.connect("localhost", 5555).await?;
//!
//! while !client.is_connected() {
//!     tokio::time::sleep(std::time::Duration::from_millis(10)).await;
//! }
//! client.send(b"PING")?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod core;
pub mod layer;
pub mod server;
pub mod transport;

#[cfg(test)]
mod test_util;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::{ClientConfig, ClientConfigBuilder, HandshakeMode, KcpClient};
    pub use crate::core::*;
    pub use crate::layer::{DeliveryMethod, KcpTransport};
    pub use crate::server::{KcpServer, ServerConfig, ServerConfigBuilder};
    pub use crate::transport::{
        ConnectionId, ConnectionPhase, EngineSettings, EventKind, TransportEvent,
    };
}

pub use crate::core::{TransportError, TransportResult};
pub use layer::{DeliveryMethod, KcpTransport};
