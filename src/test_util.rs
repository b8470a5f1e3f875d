//! Shared fixtures for unit tests.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

use tracing::Level;

use crate::core::{ArqEngine, DatagramSink, EngineError, EngineFactory};
use crate::transport::{
    Connection, ConnectionId, EndpointCell, EngineOutput, EngineSettings,
};

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub fn connection(id: u32, endpoint: SocketAddr) -> Connection {
    Connection::new(
        ConnectionId::new(id),
        EndpointCell::new(endpoint),
        Box::new(NullEngine),
    )
}

/// Engine that accepts everything and yields nothing.
pub struct NullEngine;

impl ArqEngine for NullEngine {
    fn input(&mut self, _data: &[u8]) -> Result<(), EngineError> {
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> Result<usize, EngineError> {
        Ok(frame.len())
    }

    fn peek_size(&self) -> Option<usize> {
        None
    }

    fn recv(&mut self, _buf: &mut [u8]) -> Result<usize, EngineError> {
        Err(EngineError::Rejected("empty".into()))
    }

    fn tick(&mut self, _now_ms: u32) -> Result<(), EngineError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Unreliable engine: every input is one frame, every send is one datagram.
pub struct PassthroughEngine {
    output: EngineOutput,
    frames: VecDeque<Vec<u8>>,
}

impl ArqEngine for PassthroughEngine {
    fn input(&mut self, data: &[u8]) -> Result<(), EngineError> {
        self.frames.push_back(data.to_vec());
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> Result<usize, EngineError> {
        self.output.write_datagram(frame);
        Ok(frame.len())
    }

    fn peek_size(&self) -> Option<usize> {
        self.frames.front().map(Vec::len)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, EngineError> {
        let frame = self
            .frames
            .pop_front()
            .ok_or_else(|| EngineError::Rejected("empty".into()))?;
        buf[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }

    fn tick(&mut self, _now_ms: u32) -> Result<(), EngineError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

pub struct PassthroughFactory;

impl EngineFactory for PassthroughFactory {
    fn create(
        &self,
        _connection_id: ConnectionId,
        _settings: &EngineSettings,
        output: EngineOutput,
    ) -> Box<dyn ArqEngine> {
        Box::new(PassthroughEngine {
            output,
            frames: VecDeque::new(),
        })
    }
}

/// Sink recording every datagram instead of sending it.
#[derive(Default)]
pub struct CaptureSink {
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl DatagramSink for CaptureSink {
    fn write_datagram(&self, datagram: &[u8], dest: SocketAddr) -> io::Result<()> {
        self.sent.lock().unwrap().push((datagram.to_vec(), dest));
        Ok(())
    }
}
