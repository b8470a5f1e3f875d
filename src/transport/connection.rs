//! Connection identity and per-connection state.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::socket::ControlStream;
use crate::core::ArqEngine;
use crate::core::constants::FIRST_CONNECTION_ID;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stable identifier of a logical connection.
///
/// Assigned by the accepting side only, never reused within one transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u32);

impl ConnectionId {
    /// Wrap a raw id.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw wire value.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ConnectionId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<ConnectionId> for u32 {
    fn from(id: ConnectionId) -> u32 {
        id.0
    }
}

/// Monotonic connection id source, owned by one transport instance.
///
/// Ids start at 1 (`0` marks out-of-band handshake datagrams) and never wrap.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU32,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    /// Create an allocator whose first id is 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(FIRST_CONNECTION_ID),
        }
    }

    /// Hand out the next id, or `None` once the id space is exhausted.
    pub fn allocate(&self) -> Option<ConnectionId> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_add(1))
            .ok()
            .map(ConnectionId)
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Registered, handshake not yet complete.
    Pending,
    /// Handshake complete, data flows.
    Connected,
    /// A disconnect was observed; removal happens on the next tick.
    Disconnecting,
    /// Torn down and removed from the registry.
    Closed,
}

impl ConnectionPhase {
    /// Whether a disconnect may still be started from this phase.
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionPhase::Pending | ConnectionPhase::Connected)
    }
}

/// Destination endpoint shared between a connection and its engine output.
///
/// Rebinding the connection updates the address the engine writes to, so engine output
/// never targets a stale endpoint.
#[derive(Debug, Clone)]
pub struct EndpointCell(Arc<Mutex<SocketAddr>>);

impl EndpointCell {
    /// Create a cell holding `addr`.
    pub fn new(addr: SocketAddr) -> Self {
        Self(Arc::new(Mutex::new(addr)))
    }

    /// Current endpoint.
    pub fn get(&self) -> SocketAddr {
        *lock(&self.0)
    }

    /// Point the cell at a new endpoint.
    pub fn set(&self, addr: SocketAddr) {
        *lock(&self.0) = addr;
    }
}

/// Engine handle shared between the registry, the receive path and the tick driver.
pub type SharedEngine = Arc<Mutex<Box<dyn ArqEngine>>>;

/// A registered logical connection.
///
/// Exclusively owns its engine; the engine is dropped (disposed) together with the
/// last handle once the connection is removed.
pub struct Connection {
    id: ConnectionId,
    endpoint: EndpointCell,
    phase: ConnectionPhase,
    endpoint_confirmed: bool,
    engine: SharedEngine,
    control: Option<Arc<ControlStream>>,
    created_at: Instant,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.get())
            .field("phase", &self.phase)
            .field("endpoint_confirmed", &self.endpoint_confirmed)
            .field("has_control", &self.control.is_some())
            .finish()
    }
}

impl Connection {
    /// Create a pending connection.
    pub fn new(id: ConnectionId, endpoint: EndpointCell, engine: Box<dyn ArqEngine>) -> Self {
        Self {
            id,
            endpoint,
            phase: ConnectionPhase::Pending,
            endpoint_confirmed: false,
            engine: Arc::new(Mutex::new(engine)),
            control: None,
            created_at: Instant::now(),
        }
    }

    /// Attach the control stream used to bootstrap this connection.
    pub fn with_control(mut self, control: Arc<ControlStream>) -> Self {
        self.control = Some(control);
        self
    }

    /// Start in the given phase.
    pub fn with_phase(mut self, phase: ConnectionPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current data endpoint.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint.get()
    }

    /// Lifecycle phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Whether a datagram has confirmed the data endpoint.
    pub fn endpoint_confirmed(&self) -> bool {
        self.endpoint_confirmed
    }

    /// Time since registration.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn set_phase(&mut self, phase: ConnectionPhase) {
        self.phase = phase;
    }

    pub(crate) fn bind_endpoint(&mut self, addr: SocketAddr) {
        self.endpoint.set(addr);
        self.endpoint_confirmed = true;
    }

    pub(crate) fn confirm_endpoint(&mut self) {
        self.endpoint_confirmed = true;
    }

    pub(crate) fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            id: self.id,
            endpoint: self.endpoint.get(),
            phase: self.phase,
            engine: Arc::clone(&self.engine),
            control: self.control.clone(),
        }
    }
}

/// Point-in-time view of a connection, safe to use without holding the registry lock.
#[derive(Clone)]
pub struct ConnectionHandle {
    /// Connection id.
    pub id: ConnectionId,
    /// Data endpoint at the time of the snapshot.
    pub endpoint: SocketAddr,
    /// Phase at the time of the snapshot.
    pub phase: ConnectionPhase,
    /// The connection's engine.
    pub engine: SharedEngine,
    /// Control stream, for connections accepted over the control channel.
    pub control: Option<Arc<ControlStream>>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("phase", &self.phase)
            .finish()
    }
}
