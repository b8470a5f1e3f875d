//! One transport instance: data socket, registry, event queue and background tasks.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::connection::{lock, ConnectionId, ConnectionPhase};
use super::demux::Demultiplexer;
use super::events::TransportEvent;
use super::frame::{encode_frame, FrameType};
use super::socket::{is_ignorable, DataSocket};
use crate::core::constants::{FRAME_TAG_DISCONNECT, MAX_DATAGRAM_SIZE};
use crate::core::{TransportError, TransportResult};

/// Everything a started client or server owns.
///
/// The consumer drives [`receive`](Self::receive) from its own loop; the accept loop and the tick
/// driver run as tokio tasks tied to this peer's cancellation token.
pub struct Peer {
    socket: Arc<DataSocket>,
    demux: Arc<Demultiplexer>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    recv_buf: Vec<u8>,
    max_datagrams_per_poll: usize,
}

impl Peer {
    /// Assemble a peer around a bound data socket.
    pub fn new(socket: Arc<DataSocket>, demux: Arc<Demultiplexer>, max_datagrams_per_poll: usize) -> Self {
        Self {
            socket,
            demux,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            max_datagrams_per_poll: max_datagrams_per_poll.max(1),
        }
    }

    /// Address of the shared data socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The demultiplexer, shared with background tasks.
    pub fn demux(&self) -> &Arc<Demultiplexer> {
        &self.demux
    }

    /// Token cancelled when this peer stops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Track a background task so [`stop`](Self::stop) can await it.
    pub fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.demux.registry().len()
    }

    /// Phase of a connection.
    pub fn phase(&self, id: ConnectionId) -> Option<ConnectionPhase> {
        self.demux.registry().phase(id)
    }

    /// Drain ready datagrams (bounded per call) into the demultiplexer. Never blocks.
    pub fn poll(&mut self) {
        for _ in 0..self.max_datagrams_per_poll {
            match self.socket.try_recv_from(&mut self.recv_buf) {
                Ok(Some((len, from))) => self.demux.on_datagram(from, &self.recv_buf[..len]),
                Ok(None) => break,
                Err(e) => {
                    let noise = is_ignorable(&e);
                    self.socket.report(None, &e);
                    if !noise {
                        break;
                    }
                }
            }
        }
    }

    /// Poll the socket, then pop the oldest event.
    pub fn receive(&mut self) -> Option<TransportEvent> {
        self.poll();
        self.demux.events().try_dequeue()
    }

    /// Queue `payload` as a Data frame on a connected connection.
    ///
    /// Returns the number of bytes the engine accepted.
    pub fn send(&self, id: ConnectionId, payload: &[u8]) -> TransportResult<usize> {
        let handle = self
            .demux
            .registry()
            .find_by_id(id)
            .ok_or(TransportError::UnknownConnection(id))?;
        if handle.phase != ConnectionPhase::Connected {
            return Err(TransportError::NotConnected);
        }
        let frame = encode_frame(FrameType::Data, payload);
        let queued = lock(&handle.engine).send(&frame)?;
        Ok(queued)
    }

    /// Tell the remote side to go away and start local teardown.
    ///
    /// The Disconnect frame goes through the engine (flushed immediately) and, if present, over
    /// the control stream. Removal happens on the next tick.
    pub fn disconnect(&self, id: ConnectionId) -> TransportResult<()> {
        let handle = self
            .demux
            .registry()
            .find_by_id(id)
            .ok_or(TransportError::UnknownConnection(id))?;

        {
            let mut engine = lock(&handle.engine);
            if let Err(e) = engine.send(&[FRAME_TAG_DISCONNECT]) {
                debug!("connection {}: disconnect frame not queued: {}", id, e);
            } else if let Err(e) = engine.flush() {
                debug!("connection {}: disconnect frame not flushed: {}", id, e);
            }
        }
        if let Some(control) = handle.control.as_ref() {
            if let Err(e) = control.try_send(&[FRAME_TAG_DISCONNECT]) {
                debug!("connection {}: disconnect over control stream failed: {}", id, e);
            }
        }
        if self.demux.begin_disconnect(id) {
            info!("connection {}: disconnected locally", id);
        }
        Ok(())
    }

    /// Orderly shutdown: cancel loops, await tasks, dispose engines and clear the queue.
    ///
    /// The demultiplexer shares the data socket as its sink, so the socket closes when the last
    /// demultiplexer handle goes away. Once the tasks are joined that is this call's own handle,
    /// and the port is free again when `stop` returns.
    pub async fn stop(self) {
        let Peer {
            socket,
            demux,
            shutdown,
            tasks,
            ..
        } = self;

        shutdown.cancel();
        drop(socket);
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("background task panicked: {}", e);
                }
            }
        }
        dispose(&demux);
    }

    /// Immediate shutdown from a synchronous context: tasks are aborted instead of awaited.
    ///
    /// Aborted tasks release their demultiplexer handles, and with them the data socket, only
    /// once the runtime has dropped them.
    pub fn halt(self) {
        let Peer {
            socket,
            demux,
            shutdown,
            tasks,
            ..
        } = self;

        shutdown.cancel();
        drop(socket);
        for task in tasks {
            task.abort();
        }
        dispose(&demux);
    }
}

fn dispose(demux: &Demultiplexer) {
    let engines = demux.registry().clear();
    debug!("disposing {} engines", engines.len());
    drop(engines);
    demux.events().clear();
}
