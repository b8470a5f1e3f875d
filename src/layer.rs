//! Transport facade for game-networking frameworks.
//!
//! [`KcpTransport`] exposes the start/stop/send/receive surface a host framework polls once per
//! frame. Failures never cross this boundary as errors: start calls return `false`, send calls
//! return `false`, and network trouble shows up as Error or Disconnect events.

use std::time::Duration;

use tracing::{debug, warn};

use crate::client::{ClientConfig, KcpClient};
use crate::server::{KcpServer, ServerConfig};
use crate::transport::{ConnectionId, EngineSettings, TransportEvent};

/// Delivery guarantees requested by the host framework.
///
/// Accepted for interface compatibility only: every payload travels through the connection's
/// reliable, ordered engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DeliveryMethod {
    /// Fire and forget.
    Unreliable,
    /// Delivered, any order.
    ReliableUnordered,
    /// Only the newest is delivered.
    Sequenced,
    /// Delivered, in order.
    #[default]
    ReliableOrdered,
    /// Newest delivered reliably.
    ReliableSequenced,
}

/// Client and server halves behind one facade.
pub struct KcpTransport {
    client_config: ClientConfig,
    server_config: ServerConfig,
    client: Option<KcpClient>,
    server: Option<KcpServer>,
}

impl Default for KcpTransport {
    fn default() -> Self {
        Self::new(ClientConfig::default(), ServerConfig::default())
    }
}

impl KcpTransport {
    /// Create a facade with per-role configuration.
    pub fn new(client_config: ClientConfig, server_config: ServerConfig) -> Self {
        Self {
            client_config,
            server_config,
            client: None,
            server: None,
        }
    }

    /// Create a facade with default configuration and the given engine settings per role.
    pub fn with_engine_settings(client: EngineSettings, server: EngineSettings) -> Self {
        Self::new(
            ClientConfig {
                engine: client,
                ..ClientConfig::default()
            },
            ServerConfig {
                engine: server,
                ..ServerConfig::default()
            },
        )
    }

    /// Shorten the tick cadence of both roles.
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.client_config.update_interval = interval;
        self.server_config.update_interval = interval;
        self
    }

    /// Connect to `address:port`. Returns `false` if already started or on any failure.
    pub async fn start_client(&mut self, address: &str, port: u16) -> bool {
        if self.is_client_started() {
            return false;
        }
        let mut client = KcpClient::new(self.client_config.clone());
        match client.connect(address, port).await {
            Ok(()) => {
                self.client = Some(client);
                true
            }
            Err(e) => {
                warn!("client start towards {}:{} failed: {}", address, port, e);
                false
            }
        }
    }

    /// Listen on `port`. Returns `false` if already started or on any failure.
    pub async fn start_server(&mut self, port: u16, max_connections: usize) -> bool {
        if self.is_server_started() {
            return false;
        }
        let config = ServerConfig {
            port,
            max_connections,
            ..self.server_config.clone()
        };
        let mut server = KcpServer::new(config);
        match server.start().await {
            Ok(()) => {
                self.server = Some(server);
                true
            }
            Err(e) => {
                warn!("server start on port {} failed: {}", port, e);
                false
            }
        }
    }

    /// Stop the client, if started.
    pub async fn stop_client(&mut self) {
        if let Some(mut client) = self.client.take() {
            client.stop().await;
        }
    }

    /// Stop the server, if started.
    pub async fn stop_server(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.stop().await;
        }
    }

    /// Stop both roles.
    pub async fn destroy(&mut self) {
        self.stop_client().await;
        self.stop_server().await;
    }

    /// Next client event. A Disconnect event stops the client.
    pub fn client_receive(&mut self) -> Option<TransportEvent> {
        let client = self.client.as_mut()?;
        let event = client.receive();
        if !client.is_started() {
            self.client = None;
        }
        event
    }

    /// Next server event.
    pub fn server_receive(&mut self) -> Option<TransportEvent> {
        self.server.as_mut()?.receive()
    }

    /// Process ready datagrams for both roles without consuming events.
    pub fn poll(&mut self) {
        if let Some(client) = self.client.as_mut() {
            client.poll();
        }
        if let Some(server) = self.server.as_mut() {
            server.poll();
        }
    }

    /// Send to the server. `channel` and `delivery` are passed through untouched.
    pub fn client_send(&self, channel: u8, delivery: DeliveryMethod, payload: &[u8]) -> bool {
        let Some(client) = self.client.as_ref() else {
            return false;
        };
        match client.send(payload) {
            Ok(_) => true,
            Err(e) => {
                debug!("client send ({}, {:?}) failed: {}", channel, delivery, e);
                false
            }
        }
    }

    /// Send to one connection. `channel` and `delivery` are passed through untouched.
    pub fn server_send(
        &self,
        connection_id: ConnectionId,
        channel: u8,
        delivery: DeliveryMethod,
        payload: &[u8],
    ) -> bool {
        let Some(server) = self.server.as_ref() else {
            return false;
        };
        match server.send(connection_id, payload) {
            Ok(_) => true,
            Err(e) => {
                debug!(
                    "send to {} ({}, {:?}) failed: {}",
                    connection_id, channel, delivery, e
                );
                false
            }
        }
    }

    /// Disconnect one connection. Returns `false` for unknown ids or a stopped server.
    pub fn server_disconnect(&self, connection_id: ConnectionId) -> bool {
        self.server
            .as_ref()
            .is_some_and(|server| server.disconnect(connection_id).is_ok())
    }

    /// Whether the client is running.
    pub fn is_client_started(&self) -> bool {
        self.client.as_ref().is_some_and(KcpClient::is_started)
    }

    /// Whether the server is running.
    pub fn is_server_started(&self) -> bool {
        self.server.as_ref().is_some_and(KcpServer::is_started)
    }

    /// Number of connections registered on the server.
    pub fn server_peers_count(&self) -> usize {
        self.server.as_ref().map_or(0, KcpServer::connection_count)
    }

    /// Connection limit of the running server, `0` when stopped.
    pub fn server_max_connections(&self) -> usize {
        self.server.as_ref().map_or(0, KcpServer::max_connections)
    }

    /// The running client.
    pub fn client(&self) -> Option<&KcpClient> {
        self.client.as_ref()
    }

    /// The running server.
    pub fn server(&self) -> Option<&KcpServer> {
        self.server.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stopped_facade_refuses_everything() {
        let mut transport = KcpTransport::default();
        assert!(!transport.is_client_started());
        assert!(!transport.is_server_started());
        assert!(transport.client_receive().is_none());
        assert!(transport.server_receive().is_none());
        assert!(!transport.client_send(0, DeliveryMethod::ReliableOrdered, b"x"));
        assert!(!transport.server_send(ConnectionId::new(1), 0, DeliveryMethod::Unreliable, b"x"));
        assert!(!transport.server_disconnect(ConnectionId::new(1)));
        assert_eq!(transport.server_peers_count(), 0);
        assert_eq!(transport.server_max_connections(), 0);
        transport.destroy().await;
    }

    #[tokio::test]
    async fn test_server_start_twice_fails() {
        let mut transport = KcpTransport::default();
        assert!(transport.start_server(0, 4).await);
        assert!(transport.is_server_started());
        assert_eq!(transport.server_max_connections(), 4);
        assert!(!transport.start_server(0, 4).await);
        transport.stop_server().await;
        assert!(!transport.is_server_started());
    }

    #[tokio::test]
    async fn test_start_server_rejects_zero_capacity() {
        let mut transport = KcpTransport::default();
        assert!(!transport.start_server(0, 0).await);
        assert!(!transport.is_server_started());
    }

    #[tokio::test]
    async fn test_start_client_unresolvable() {
        let mut transport = KcpTransport::default();
        assert!(!transport.start_client("host.invalid", 5555).await);
        assert!(!transport.is_client_started());
    }
}
