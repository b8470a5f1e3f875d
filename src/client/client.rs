//! KCP multiplexing client.
//!
//! Provides [`KcpClient`], holding exactly one connection to one server.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info};

use super::bootstrap::{resolve, run_control};
use crate::core::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_HELLO_INTERVAL, DEFAULT_MAX_DATAGRAMS_PER_POLL,
    DEFAULT_UPDATE_INTERVAL,
};
use crate::core::{EngineFactory, SettingsError, TransportError, TransportResult};
use crate::transport::{
    ConnectionId, ConnectionPhase, ControlStream, DataSocket, Demultiplexer, EngineSettings,
    EventKind, EventQueue, HelloBeacon, KcpEngineFactory, Peer, Registry, Role, TickDriver,
    TransportEvent,
};

/// How a client obtains its connection id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum HandshakeMode {
    /// Connect the control stream; the server writes the accept message on it.
    #[default]
    Stream,
    /// Send hello datagrams to the data socket until the server replies.
    Datagram,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Handshake used to obtain the connection id.
    pub handshake: HandshakeMode,

    /// Settings applied to the client's engine.
    pub engine: EngineSettings,

    /// Timeout for establishing the control stream.
    pub connect_timeout: Duration,

    /// Interval between hello datagrams in [`HandshakeMode::Datagram`].
    pub hello_interval: Duration,

    /// Cadence of the tick driver.
    pub update_interval: Duration,

    /// Upper bound of datagrams processed per [`KcpClient::receive`] call.
    pub max_datagrams_per_poll: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeMode::Stream,
            engine: EngineSettings::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            hello_interval: DEFAULT_HELLO_INTERVAL,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            max_datagrams_per_poll: DEFAULT_MAX_DATAGRAMS_PER_POLL,
        }
    }
}

impl ClientConfig {
    /// Check the configuration before any socket is opened.
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.engine.validate()?;
        if self.update_interval.is_zero() || self.hello_interval.is_zero() {
            return Err(SettingsError::ZeroInterval);
        }
        Ok(())
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handshake mode.
    pub fn handshake(mut self, mode: HandshakeMode) -> Self {
        self.config.handshake = mode;
        self
    }

    /// Set the engine settings.
    pub fn engine(mut self, settings: EngineSettings) -> Self {
        self.config.engine = settings;
        self
    }

    /// Set the control stream connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the hello interval.
    pub fn hello_interval(mut self, interval: Duration) -> Self {
        self.config.hello_interval = interval;
        self
    }

    /// Set the tick cadence.
    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.config.update_interval = interval;
        self
    }

    /// Set the per-poll datagram bound.
    pub fn max_datagrams_per_poll(mut self, max: usize) -> Self {
        self.config.max_datagrams_per_poll = max;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// A client holding one logical connection to a [`KcpServer`](crate::server::KcpServer).
///
/// The client stops itself when it observes a Disconnect event.
pub struct KcpClient {
    config: ClientConfig,
    factory: Arc<dyn EngineFactory>,
    peer: Option<Peer>,
    server: Option<SocketAddr>,
}

impl KcpClient {
    /// Create a stopped client using KCP engines.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            factory: Arc::new(KcpEngineFactory),
            peer: None,
            server: None,
        }
    }

    /// Use a different engine implementation.
    pub fn with_engine_factory(mut self, factory: Arc<dyn EngineFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Resolve `host` (IPv4 preferred) and [`start`](Self::start).
    pub async fn connect(&mut self, host: &str, port: u16) -> TransportResult<()> {
        let server = resolve(host, port).await?;
        self.start(server).await
    }

    /// Start the client against `server`.
    ///
    /// In [`HandshakeMode::Stream`] `server` is the control listener; the data endpoint comes
    /// from the accept message. In [`HandshakeMode::Datagram`] `server` is the data socket.
    /// Fails if the client is already started.
    pub async fn start(&mut self, server: SocketAddr) -> TransportResult<()> {
        if self.peer.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        self.config.validate()?;

        let control = match self.config.handshake {
            HandshakeMode::Stream => {
                let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(server))
                    .await
                    .map_err(|_| TransportError::ConnectTimeout)??;
                Some(ControlStream::new(stream, server))
            }
            HandshakeMode::Datagram => None,
        };

        let events = Arc::new(EventQueue::new());
        let local = match server.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = Arc::new(
            DataSocket::bind(local, Arc::clone(&events))
                .await
                .map_err(TransportError::Bind)?,
        );

        let demux = Arc::new(Demultiplexer::new(
            Role::Client {
                binding: Arc::new(OnceLock::new()),
            },
            Arc::new(Registry::new()),
            events,
            Arc::clone(&self.factory),
            self.config.engine.clone(),
            socket.clone(),
        ));

        let mut peer = Peer::new(socket.clone(), Arc::clone(&demux), self.config.max_datagrams_per_poll);
        let shutdown = peer.shutdown_token();
        let mut driver = TickDriver::new(Arc::clone(&demux));
        match control {
            Some(control) => {
                peer.track(tokio::spawn(run_control(
                    control,
                    Arc::clone(&demux),
                    shutdown.clone(),
                )));
            }
            None => {
                driver = driver.with_beacon(HelloBeacon::new(socket, server, self.config.hello_interval));
            }
        }
        peer.track(driver.spawn(self.config.update_interval, shutdown));

        info!("client started towards {} ({:?} handshake)", server, self.config.handshake);
        self.server = Some(server);
        self.peer = Some(peer);
        Ok(())
    }

    /// Stop the client. A bound client first sends a Disconnect frame to the server.
    pub async fn stop(&mut self) {
        self.server = None;
        let Some(peer) = self.peer.take() else {
            return;
        };
        farewell(&peer);
        peer.stop().await;
        info!("client stopped");
    }

    /// Whether the client is started.
    pub fn is_started(&self) -> bool {
        self.peer.is_some()
    }

    /// Whether the client holds a connected connection id.
    pub fn is_connected(&self) -> bool {
        self.peer.as_ref().is_some_and(|peer| {
            peer.demux()
                .client_binding()
                .is_some_and(|id| peer.phase(id) == Some(ConnectionPhase::Connected))
        })
    }

    /// Id assigned by the server.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.peer.as_ref()?.demux().client_binding()
    }

    /// Poll the data socket and return the oldest event. Never blocks.
    ///
    /// Returning a Disconnect event stops the client.
    pub fn receive(&mut self) -> Option<TransportEvent> {
        let event = self.peer.as_mut()?.receive()?;
        if event.kind() == EventKind::Disconnect {
            info!("disconnected from server");
            self.server = None;
            if let Some(peer) = self.peer.take() {
                peer.halt();
            }
        }
        Some(event)
    }

    /// Process ready datagrams without taking an event off the queue.
    pub fn poll(&mut self) {
        if let Some(peer) = self.peer.as_mut() {
            peer.poll();
        }
    }

    /// Send `payload` to the server.
    pub fn send(&self, payload: &[u8]) -> TransportResult<usize> {
        let peer = self.peer.as_ref().ok_or(TransportError::NotStarted)?;
        let id = peer
            .demux()
            .client_binding()
            .ok_or(TransportError::NotConnected)?;
        peer.send(id, payload)
    }

    /// Local address of the data socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.peer.as_ref()?.local_addr().ok()
    }

    /// Address passed to [`start`](Self::start).
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for KcpClient {
    fn drop(&mut self) {
        if let Some(peer) = self.peer.take() {
            farewell(&peer);
            peer.halt();
        }
    }
}

/// Tell the server a bound client is leaving, over the engine and the control stream.
fn farewell(peer: &Peer) {
    if let Some(id) = peer.demux().client_binding() {
        if let Err(e) = peer.disconnect(id) {
            debug!("connection {}: farewell not sent: {}", id, e);
        }
    }
}
