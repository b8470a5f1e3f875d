//! Engine settings and the KCP-backed engine factory.

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use kcp::Kcp;
use tracing::{trace, warn};

use super::connection::{ConnectionId, EndpointCell};
use crate::core::constants::{
    CONNECTION_PREFIX_SIZE, DEFAULT_ENGINE_INTERVAL_MS, DEFAULT_MTU, DEFAULT_RECEIVE_WINDOW,
    DEFAULT_SEND_WINDOW, MIN_MTU,
};
use crate::core::{ArqEngine, DatagramSink, EngineError, EngineFactory, SettingsError};

/// Tuning knobs applied to every engine of one role (client or server).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineSettings {
    /// Disable the engine's delayed-ACK / minimum-RTO behaviour.
    pub enable_no_delay: bool,
    /// Engine internal update interval, in milliseconds.
    pub tick_interval_ms: u32,
    /// Duplicate-ACK count that triggers a fast resend (`0` disables it).
    pub fast_resend_threshold: u32,
    /// Turn congestion control off.
    pub disable_congestion_control: bool,
    /// Send window, in segments.
    pub send_window: u16,
    /// Receive window, in segments.
    pub receive_window: u16,
    /// Maximum datagram size on the wire, connection prefix included.
    pub mtu: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            enable_no_delay: false,
            tick_interval_ms: DEFAULT_ENGINE_INTERVAL_MS,
            fast_resend_threshold: 0,
            disable_congestion_control: false,
            send_window: DEFAULT_SEND_WINDOW,
            receive_window: DEFAULT_RECEIVE_WINDOW,
            mtu: DEFAULT_MTU,
        }
    }
}

impl EngineSettings {
    /// Low-latency preset: no-delay, 10 ms interval, fast resend after 2 duplicate ACKs,
    /// congestion control off.
    pub fn turbo() -> Self {
        Self {
            enable_no_delay: true,
            tick_interval_ms: 10,
            fast_resend_threshold: 2,
            disable_congestion_control: true,
            ..Self::default()
        }
    }

    /// Reject settings no engine could run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.mtu < MIN_MTU {
            return Err(SettingsError::MtuTooSmall {
                mtu: self.mtu,
                min: MIN_MTU,
            });
        }
        if self.send_window == 0 || self.receive_window == 0 {
            return Err(SettingsError::ZeroWindow);
        }
        if self.tick_interval_ms == 0 {
            return Err(SettingsError::ZeroInterval);
        }
        Ok(())
    }

    /// MTU handed to the engine: the wire MTU minus the connection prefix.
    pub fn engine_mtu(&self) -> usize {
        self.mtu.saturating_sub(CONNECTION_PREFIX_SIZE)
    }
}

/// Output side of an engine: prefixes each datagram with the connection id and writes it to
/// the connection's current endpoint.
///
/// Send failures are handled by the sink (classified, reported as events) and never
/// propagate into the engine; the engine retransmits lost datagrams anyway.
pub struct EngineOutput {
    connection_id: ConnectionId,
    destination: EndpointCell,
    sink: Arc<dyn DatagramSink>,
    scratch: BytesMut,
}

impl fmt::Debug for EngineOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineOutput")
            .field("connection_id", &self.connection_id)
            .field("destination", &self.destination.get())
            .finish()
    }
}

impl EngineOutput {
    /// Create an output for `connection_id` writing to `destination` through `sink`.
    pub fn new(
        connection_id: ConnectionId,
        destination: EndpointCell,
        sink: Arc<dyn DatagramSink>,
    ) -> Self {
        Self {
            connection_id,
            destination,
            sink,
            scratch: BytesMut::new(),
        }
    }

    /// The connection this output belongs to.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Write one engine datagram.
    pub fn write_datagram(&mut self, engine_bytes: &[u8]) {
        self.scratch.clear();
        self.scratch.reserve(CONNECTION_PREFIX_SIZE + engine_bytes.len());
        self.scratch.put_u32_le(self.connection_id.get());
        self.scratch.put_slice(engine_bytes);

        let dest = self.destination.get();
        if let Err(e) = self.sink.write_datagram(&self.scratch, dest) {
            trace!("connection {}: datagram to {} dropped: {}", self.connection_id, dest, e);
        }
    }
}

impl io::Write for EngineOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_datagram(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn rejected(err: impl fmt::Display) -> EngineError {
    EngineError::Rejected(err.to_string())
}

/// [`ArqEngine`] backed by the `kcp` crate.
pub struct KcpEngine {
    kcp: Kcp<EngineOutput>,
}

impl KcpEngine {
    /// Build and configure a KCP instance whose conversation id is the connection id.
    pub fn new(connection_id: ConnectionId, settings: &EngineSettings, output: EngineOutput) -> Self {
        let mut kcp = Kcp::new(connection_id.get(), output);
        kcp.set_nodelay(
            settings.enable_no_delay,
            i32::try_from(settings.tick_interval_ms).unwrap_or(i32::MAX),
            i32::try_from(settings.fast_resend_threshold).unwrap_or(i32::MAX),
            settings.disable_congestion_control,
        );
        kcp.set_wndsize(settings.send_window, settings.receive_window);
        if let Err(e) = kcp.set_mtu(settings.engine_mtu()) {
            warn!(
                "connection {}: mtu {} rejected by engine, keeping default: {}",
                connection_id,
                settings.engine_mtu(),
                e
            );
        }
        Self { kcp }
    }
}

impl ArqEngine for KcpEngine {
    fn input(&mut self, data: &[u8]) -> Result<(), EngineError> {
        self.kcp.input(data).map(|_| ()).map_err(rejected)
    }

    fn send(&mut self, frame: &[u8]) -> Result<usize, EngineError> {
        self.kcp.send(frame).map_err(rejected)
    }

    fn peek_size(&self) -> Option<usize> {
        self.kcp.peeksize().ok()
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, EngineError> {
        self.kcp.recv(buf).map_err(rejected)
    }

    /// Fails once the peer stopped acknowledging and KCP gave up on the link.
    fn tick(&mut self, now_ms: u32) -> Result<(), EngineError> {
        self.kcp.update(now_ms).map_err(rejected)?;
        if self.kcp.is_dead_link() {
            return Err(rejected("dead link"));
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), EngineError> {
        self.kcp.flush().map_err(rejected)
    }
}

/// Factory producing [`KcpEngine`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct KcpEngineFactory;

impl EngineFactory for KcpEngineFactory {
    fn create(
        &self,
        connection_id: ConnectionId,
        settings: &EngineSettings,
        output: EngineOutput,
    ) -> Box<dyn ArqEngine> {
        Box::new(KcpEngine::new(connection_id, settings, output))
    }
}
