//! KCP multiplexing server.
//!
//! Provides [`KcpServer`], accepting many peers on one shared UDP data socket.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use super::handshake::accept_loop;
use crate::core::constants::{
    DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_DATAGRAMS_PER_POLL, DEFAULT_UPDATE_INTERVAL,
};
use crate::core::{EngineFactory, SettingsError, TransportError, TransportResult};
use crate::transport::{
    ConnectionId, DataSocket, Demultiplexer, EngineSettings, EventQueue, KcpEngineFactory, Peer,
    Registry, Role, TickDriver, TransportEvent,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind both sockets to.
    pub bind_ip: IpAddr,

    /// Port of the data socket and of the control listener. `0` picks ephemeral ports,
    /// chosen independently for each socket.
    pub port: u16,

    /// Maximum number of registered connections.
    pub max_connections: usize,

    /// Settings applied to every server-side engine.
    pub engine: EngineSettings,

    /// Cadence of the tick driver.
    pub update_interval: Duration,

    /// Let datagrams from a new source re-bind an established connection.
    pub allow_endpoint_rebinding: bool,

    /// Upper bound of datagrams processed per [`KcpServer::receive`] call.
    pub max_datagrams_per_poll: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            engine: EngineSettings::default(),
            update_interval: DEFAULT_UPDATE_INTERVAL,
            allow_endpoint_rebinding: false,
            max_datagrams_per_poll: DEFAULT_MAX_DATAGRAMS_PER_POLL,
        }
    }
}

impl ServerConfig {
    /// Check the configuration before any socket is bound.
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.engine.validate()?;
        if self.max_connections == 0 {
            return Err(SettingsError::ZeroCapacity);
        }
        if self.update_interval.is_zero() {
            return Err(SettingsError::ZeroInterval);
        }
        Ok(())
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.config.bind_ip = ip;
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the connection limit.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set the engine settings.
    pub fn engine(mut self, settings: EngineSettings) -> Self {
        self.config.engine = settings;
        self
    }

    /// Set the tick cadence.
    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.config.update_interval = interval;
        self
    }

    /// Allow or forbid endpoint re-binding.
    pub fn allow_endpoint_rebinding(mut self, allow: bool) -> Self {
        self.config.allow_endpoint_rebinding = allow;
        self
    }

    /// Set the per-poll datagram bound.
    pub fn max_datagrams_per_poll(mut self, max: usize) -> Self {
        self.config.max_datagrams_per_poll = max;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

/// A server multiplexing many logical connections over one UDP socket.
///
/// # Example
///
/// ```no_run
/// use kcp_transport::server::{KcpServer, ServerConfigBuilder};
/// use kcp_transport::transport::TransportEvent;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ServerConfigBuilder::new().port(5555).max_connections(16).build();
/// let mut server = KcpServer::new(config);
/// server.start().await?;
///
/// loop {
///     while let Some(event) = server.receive() {
///         if let TransportEvent::Data { connection_id, payload, .. } = event {
///             server.send(connection_id, &payload)?;
///         }
///     }
///     tokio::time::sleep(std::time::Duration::from_millis(16)).await;
/// }
/// # }
/// ```
pub struct KcpServer {
    config: ServerConfig,
    factory: Arc<dyn EngineFactory>,
    peer: Option<Peer>,
    control_addr: Option<SocketAddr>,
}

impl KcpServer {
    /// Create a stopped server using KCP engines.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            factory: Arc::new(KcpEngineFactory),
            peer: None,
            control_addr: None,
        }
    }

    /// Use a different engine implementation.
    pub fn with_engine_factory(mut self, factory: Arc<dyn EngineFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Bind the sockets and spawn the accept loop and tick driver.
    ///
    /// Fails if the server is already started.
    pub async fn start(&mut self) -> TransportResult<()> {
        if self.peer.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        self.config.validate()?;

        let events = Arc::new(EventQueue::new());
        let data_addr = SocketAddr::new(self.config.bind_ip, self.config.port);
        let socket = Arc::new(
            DataSocket::bind(data_addr, Arc::clone(&events))
                .await
                .map_err(TransportError::Bind)?,
        );
        let data_port = socket.local_addr()?.port();

        let listener = TcpListener::bind(SocketAddr::new(self.config.bind_ip, self.config.port))
            .await
            .map_err(TransportError::Bind)?;
        let control_addr = listener.local_addr()?;

        let demux = Arc::new(
            Demultiplexer::new(
                Role::Server {
                    data_port,
                    max_connections: self.config.max_connections,
                },
                Arc::new(Registry::new()),
                events,
                Arc::clone(&self.factory),
                self.config.engine.clone(),
                socket.clone(),
            )
            .with_rebinding(self.config.allow_endpoint_rebinding),
        );

        let mut peer = Peer::new(socket, Arc::clone(&demux), self.config.max_datagrams_per_poll);
        let shutdown = peer.shutdown_token();
        peer.track(tokio::spawn(accept_loop(
            listener,
            Arc::clone(&demux),
            data_port,
            shutdown.clone(),
        )));
        peer.track(TickDriver::new(demux).spawn(self.config.update_interval, shutdown));

        info!(
            "server started: data port {}, control {}, max {} connections",
            data_port, control_addr, self.config.max_connections
        );
        self.control_addr = Some(control_addr);
        self.peer = Some(peer);
        Ok(())
    }

    /// Stop the server: quiesce background tasks, dispose every engine, clear the queue.
    pub async fn stop(&mut self) {
        self.control_addr = None;
        if let Some(peer) = self.peer.take() {
            peer.stop().await;
            info!("server stopped");
        }
    }

    /// Whether [`start`](Self::start) succeeded and [`stop`](Self::stop) has not been called.
    pub fn is_started(&self) -> bool {
        self.peer.is_some()
    }

    /// Poll the data socket and return the oldest event. Never blocks.
    pub fn receive(&mut self) -> Option<TransportEvent> {
        self.peer.as_mut()?.receive()
    }

    /// Process ready datagrams without taking an event off the queue.
    ///
    /// Lets a caller that is busy with another peer keep acknowledging this one's traffic.
    pub fn poll(&mut self) {
        if let Some(peer) = self.peer.as_mut() {
            peer.poll();
        }
    }

    /// Send `payload` to a connected peer.
    pub fn send(&self, id: ConnectionId, payload: &[u8]) -> TransportResult<usize> {
        self.peer()?.send(id, payload)
    }

    /// Disconnect a peer. Emits a local Disconnect event; removal happens on the next tick.
    pub fn disconnect(&self, id: ConnectionId) -> TransportResult<()> {
        self.peer()?.disconnect(id)
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.peer.as_ref().map_or(0, Peer::connection_count)
    }

    /// Configured connection limit.
    pub fn max_connections(&self) -> usize {
        self.config.max_connections
    }

    /// Address of the data socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.peer.as_ref()?.local_addr().ok()
    }

    /// Address of the control listener.
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control_addr
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn peer(&self) -> TransportResult<&Peer> {
        self.peer.as_ref().ok_or(TransportError::NotStarted)
    }
}

impl Drop for KcpServer {
    fn drop(&mut self) {
        if let Some(peer) = self.peer.take() {
            peer.halt();
        }
    }
}
