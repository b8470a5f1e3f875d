//! Collaborator seams of the transport.
//!
//! The reliable-delivery engine and the datagram socket are external to the multiplexer.
//! These traits describe exactly what the multiplexer needs from them.

use std::io;
use std::net::SocketAddr;

use super::error::EngineError;
use crate::transport::{ConnectionId, EngineOutput, EngineSettings};

/// A per-connection reliable-delivery (ARQ) engine.
///
/// The engine owns retransmission, ordering, windowing and fragmentation. It hands bytes that
/// must go on the wire to the [`EngineOutput`] it was constructed with.
///
/// # Requirements
///
/// - `recv` MUST yield frames in the order the peer sent them, without gaps
/// - `peek_size` MUST return `None` while no complete frame is buffered
/// - `tick` MUST be called periodically even when no datagram arrives
pub trait ArqEngine: Send {
    /// Feed a datagram (connection prefix already stripped) into the engine.
    fn input(&mut self, data: &[u8]) -> Result<(), EngineError>;

    /// Queue one application frame for reliable delivery.
    ///
    /// Returns the number of bytes queued.
    fn send(&mut self, frame: &[u8]) -> Result<usize, EngineError>;

    /// Size of the next fully reassembled frame, if any.
    fn peek_size(&self) -> Option<usize>;

    /// Move the next frame into `buf`, returning its length.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, EngineError>;

    /// Advance the engine clock to `now_ms` (milliseconds, wrapping).
    fn tick(&mut self, now_ms: u32) -> Result<(), EngineError>;

    /// Push everything pending to the output immediately.
    fn flush(&mut self) -> Result<(), EngineError>;
}

/// Destination for datagrams produced by engines.
pub trait DatagramSink: Send + Sync {
    /// Place one datagram on the wire.
    fn write_datagram(&self, datagram: &[u8], dest: SocketAddr) -> io::Result<()>;
}

/// Builds configured engines for new connections.
pub trait EngineFactory: Send + Sync {
    /// Create an engine for `connection_id` that writes to `output`.
    ///
    /// Construction is infallible for settings that passed
    /// [`EngineSettings::validate`].
    fn create(
        &self,
        connection_id: ConnectionId,
        settings: &EngineSettings,
        output: EngineOutput,
    ) -> Box<dyn ArqEngine>;
}
