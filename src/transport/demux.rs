//! Datagram demultiplexing and frame dispatch.
//!
//! Every datagram on the shared data channel starts with a connection id. Non-zero ids are
//! routed to the matching engine; the engine's reassembled frames are then classified and turned
//! into events. Id `0` marks an out-of-band handshake datagram carrying a raw frame.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use super::connection::{
    lock, Connection, ConnectionHandle, ConnectionId, ConnectionPhase, EndpointCell, IdAllocator,
};
use super::engine::{EngineOutput, EngineSettings};
use super::events::{EventQueue, TransportEvent};
use super::frame::{encode_datagram, split_datagram, AcceptMessage, Frame};
use super::registry::{Registry, SourceCheck};
use super::socket::ControlStream;
use crate::core::constants::{FRAME_TAG_CONNECT, UNASSIGNED_CONNECTION_ID};
use crate::core::{DatagramSink, EngineFactory, TransportError, TransportResult};

/// Which side of the handshake a demultiplexer serves.
#[derive(Debug, Clone)]
pub enum Role {
    /// Accepts many peers on one shared data socket.
    Server {
        /// Port of the shared data socket, advertised in accept messages.
        data_port: u16,
        /// Connection limit.
        max_connections: usize,
    },
    /// Single connection to one server.
    Client {
        /// Id assigned by the server. Set once; later accept messages are ignored.
        binding: Arc<OnceLock<ConnectionId>>,
    },
}

/// Routes inbound datagrams to engines and turns decoded frames into events.
///
/// Shared by the consumer's poll, the accept loop and the client bootstrap. The registry lock
/// is never held while an engine is locked.
pub struct Demultiplexer {
    role: Role,
    registry: Arc<Registry>,
    events: Arc<EventQueue>,
    ids: IdAllocator,
    factory: Arc<dyn EngineFactory>,
    settings: EngineSettings,
    sink: Arc<dyn DatagramSink>,
    allow_rebinding: bool,
}

impl Demultiplexer {
    /// Create a demultiplexer owning its own id allocator.
    pub fn new(
        role: Role,
        registry: Arc<Registry>,
        events: Arc<EventQueue>,
        factory: Arc<dyn EngineFactory>,
        settings: EngineSettings,
        sink: Arc<dyn DatagramSink>,
    ) -> Self {
        Self {
            role,
            registry,
            events,
            ids: IdAllocator::new(),
            factory,
            settings,
            sink,
            allow_rebinding: false,
        }
    }

    /// Let a later datagram source re-bind a connection's endpoint.
    pub fn with_rebinding(mut self, allow: bool) -> Self {
        self.allow_rebinding = allow;
        self
    }

    /// The registry this demultiplexer feeds.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The event queue this demultiplexer feeds.
    pub fn events(&self) -> &Arc<EventQueue> {
        &self.events
    }

    /// Id assigned to this client, if any.
    pub fn client_binding(&self) -> Option<ConnectionId> {
        match &self.role {
            Role::Client { binding } => binding.get().copied(),
            Role::Server { .. } => None,
        }
    }

    /// Handle one datagram received from `from`.
    pub fn on_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        let Some((raw_id, rest)) = split_datagram(datagram) else {
            trace!("runt datagram ({} bytes) from {}", datagram.len(), from);
            return;
        };
        if raw_id == UNASSIGNED_CONNECTION_ID {
            self.on_handshake(from, rest);
            return;
        }

        let id = ConnectionId::new(raw_id);
        match self.registry.observe_source(id, from, self.allow_rebinding) {
            SourceCheck::Accepted | SourceCheck::Rebound => {}
            SourceCheck::Rejected => {
                debug!("connection {}: datagram from unexpected source {}", id, from);
                return;
            }
            SourceCheck::Unknown => {
                trace!("datagram for unknown connection {} from {}", id, from);
                return;
            }
        }
        let Some(handle) = self.registry.find_by_id(id) else {
            return;
        };

        for frame in drain_frames(&handle, rest) {
            self.dispatch(Some(id), from, &frame);
        }
    }

    fn on_handshake(&self, from: SocketAddr, raw: &[u8]) {
        match Frame::parse(raw) {
            Ok(Frame::Connect(_)) => self.dispatch(None, from, raw),
            Ok(other) => debug!("unsequenced {:?} frame from {} ignored", other.frame_type(), from),
            Err(e) => debug!("bad handshake datagram from {}: {}", from, e),
        }
    }

    /// Classify one frame and enqueue the matching event.
    ///
    /// `origin` is the connection the frame was decoded for, `None` for handshake datagrams.
    pub fn dispatch(&self, origin: Option<ConnectionId>, from: SocketAddr, bytes: &[u8]) {
        let frame = match Frame::parse(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("dropping frame from {}: {}", from, e);
                return;
            }
        };

        match frame {
            Frame::Connect(body) => self.on_connect(origin, from, body),
            Frame::Data(payload) => {
                let Some(id) = origin.or_else(|| self.registry.find_by_endpoint(from)) else {
                    trace!("stale data from {}", from);
                    return;
                };
                self.deliver(id, from, payload);
            }
            Frame::Disconnect => {
                let Some(id) = origin.or_else(|| self.registry.find_by_endpoint(from)) else {
                    return;
                };
                info!("connection {}: peer disconnected", id);
                self.begin_disconnect(id);
            }
        }
    }

    fn on_connect(&self, origin: Option<ConnectionId>, from: SocketAddr, body: &[u8]) {
        match &self.role {
            Role::Server { data_port, .. } => {
                if let Some(existing) = self.registry.find_by_endpoint(from) {
                    trace!("connection {}: duplicate connect from {}", existing, from);
                    if origin.is_none() {
                        self.reply_accept(existing, *data_port, from);
                    }
                    if !body.is_empty() {
                        self.deliver(existing, from, body);
                    }
                    return;
                }
                if origin.is_some() {
                    return;
                }
                match self.register(from, None, ConnectionPhase::Connected) {
                    Ok(id) => {
                        // The hello itself came from the data endpoint.
                        self.registry.observe_source(id, from, false);
                        self.emit_connect(id, from);
                        self.reply_accept(id, *data_port, from);
                        if !body.is_empty() {
                            self.deliver(id, from, body);
                        }
                    }
                    Err(e) => warn!("refusing hello from {}: {}", from, e),
                }
            }
            Role::Client { .. } => {
                if origin.is_some() {
                    return;
                }
                match AcceptMessage::decode_body(body) {
                    Ok(accept) => {
                        if let Err(e) = self.bind_client(accept, from.ip()) {
                            warn!("accept from {} not applied: {}", from, e);
                        }
                    }
                    Err(e) => debug!("malformed accept from {}: {}", from, e),
                }
            }
        }
    }

    fn reply_accept(&self, id: ConnectionId, data_port: u16, to: SocketAddr) {
        let reply = encode_datagram(UNASSIGNED_CONNECTION_ID, &AcceptMessage::new(id, data_port).encode());
        if let Err(e) = self.sink.write_datagram(&reply, to) {
            trace!("connection {}: accept reply to {} failed: {}", id, to, e);
        }
    }

    fn deliver(&self, id: ConnectionId, from: SocketAddr, payload: &[u8]) {
        if self.registry.phase(id) != Some(ConnectionPhase::Connected) {
            trace!("connection {}: data outside connected phase dropped", id);
            return;
        }
        self.events.enqueue(TransportEvent::Data {
            connection_id: id,
            endpoint: from,
            payload: Bytes::copy_from_slice(payload),
        });
    }

    /// Allocate an id, build an engine and register a connection for `endpoint`.
    pub fn register(
        &self,
        endpoint: SocketAddr,
        control: Option<Arc<ControlStream>>,
        phase: ConnectionPhase,
    ) -> TransportResult<ConnectionId> {
        if let Role::Server { max_connections, .. } = self.role {
            if self.registry.len() >= max_connections {
                return Err(TransportError::CapacityReached(max_connections));
            }
        }
        let id = self.ids.allocate().ok_or(TransportError::IdsExhausted)?;
        let mut connection = self.build(id, endpoint).with_phase(phase);
        if let Some(control) = control {
            connection = connection.with_control(control);
        }
        self.registry.add(connection)?;
        debug!("connection {} registered for {} ({:?})", id, endpoint, phase);
        Ok(id)
    }

    fn build(&self, id: ConnectionId, endpoint: SocketAddr) -> Connection {
        let cell = EndpointCell::new(endpoint);
        let output = EngineOutput::new(id, cell.clone(), Arc::clone(&self.sink));
        let engine = self.factory.create(id, &self.settings, output);
        Connection::new(id, cell, engine)
    }

    /// Apply an accept message: register the server-assigned id and emit a Connect event.
    ///
    /// Returns `Ok(false)` if this client is already bound.
    pub fn bind_client(&self, accept: AcceptMessage, server_ip: IpAddr) -> TransportResult<bool> {
        let Role::Client { binding } = &self.role else {
            return Ok(false);
        };
        if binding.get().is_some() {
            trace!("already bound, accept for {} ignored", accept.connection_id);
            return Ok(false);
        }

        let id = accept.connection_id;
        let endpoint = SocketAddr::new(server_ip, accept.data_port);
        let mut connection = self.build(id, endpoint).with_phase(ConnectionPhase::Connected);
        // The server's data endpoint is known from the accept message.
        connection.confirm_endpoint();
        self.registry.add(connection)?;
        if binding.set(id).is_err() {
            self.registry.remove(id);
            return Ok(false);
        }
        info!("bound to connection {} at {}", id, endpoint);
        self.emit_connect(id, endpoint);
        Ok(true)
    }

    /// Send a Connect frame through the connection's engine, flushed immediately.
    ///
    /// A client bound over the control stream uses this so the server learns its data endpoint
    /// before either side has application data to send.
    pub fn announce(&self, id: ConnectionId) -> TransportResult<()> {
        let handle = self
            .registry
            .find_by_id(id)
            .ok_or(TransportError::UnknownConnection(id))?;
        let mut engine = lock(&handle.engine);
        engine.send(&[FRAME_TAG_CONNECT])?;
        engine.flush()?;
        trace!("connection {}: announced to {}", id, handle.endpoint);
        Ok(())
    }

    /// Move a pending connection to `Connected` and emit its Connect event.
    pub fn mark_connected(&self, id: ConnectionId) -> bool {
        let Some(handle) = self.registry.find_by_id(id) else {
            return false;
        };
        if handle.phase != ConnectionPhase::Pending {
            return false;
        }
        self.registry.set_phase(id, ConnectionPhase::Connected);
        self.emit_connect(id, handle.endpoint);
        true
    }

    fn emit_connect(&self, id: ConnectionId, endpoint: SocketAddr) {
        info!("connection {} established with {}", id, endpoint);
        self.events.enqueue(TransportEvent::Connect {
            connection_id: id,
            endpoint,
        });
    }

    /// Mark a live connection `Disconnecting` and emit its one Disconnect event.
    ///
    /// Returns `false` if the connection is unknown or already going away.
    pub fn begin_disconnect(&self, id: ConnectionId) -> bool {
        match self.registry.begin_disconnect(id) {
            Some(endpoint) => {
                self.events.enqueue(TransportEvent::Disconnect {
                    connection_id: id,
                    endpoint,
                });
                true
            }
            None => false,
        }
    }
}

/// Feed `data` into the connection's engine and drain every reassembled frame, in order.
fn drain_frames(handle: &ConnectionHandle, data: &[u8]) -> Vec<Vec<u8>> {
    let mut engine = lock(&handle.engine);
    if let Err(e) = engine.input(data) {
        debug!("connection {}: engine rejected datagram: {}", handle.id, e);
        return Vec::new();
    }

    let mut frames = Vec::new();
    while let Some(size) = engine.peek_size() {
        let mut frame = vec![0u8; size];
        match engine.recv(&mut frame) {
            Ok(n) => {
                frame.truncate(n);
                frames.push(frame);
            }
            Err(e) => {
                debug!("connection {}: engine recv failed: {}", handle.id, e);
                break;
            }
        }
    }
    frames
}
