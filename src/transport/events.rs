//! Transport events and the queue that carries them to the consumer.
//!
//! Background tasks (accept loop, tick driver) and the consumer's own receive path all produce
//! events; the consumer drains them with [`EventQueue::try_dequeue`] once per frame.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::connection::{lock, ConnectionId};

/// Event kinds, mirroring the frame tags plus socket errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A connection was established.
    Connect,
    /// Application data arrived.
    Data,
    /// A connection went away.
    Disconnect,
    /// A reportable socket error occurred.
    Error,
}

/// Socket error carried by an [`TransportEvent::Error`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketFault {
    /// Portable error category.
    pub kind: io::ErrorKind,
    /// OS error code, when the error came from the OS.
    pub os_code: Option<i32>,
}

impl From<&io::Error> for SocketFault {
    fn from(err: &io::Error) -> Self {
        Self {
            kind: err.kind(),
            os_code: err.raw_os_error(),
        }
    }
}

impl fmt::Display for SocketFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.os_code {
            Some(code) => write!(f, "{} (os error {})", self.kind, code),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// One observable occurrence. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection was established.
    Connect {
        /// Connection id.
        connection_id: ConnectionId,
        /// Peer endpoint.
        endpoint: SocketAddr,
    },

    /// A decoded application payload.
    Data {
        /// Connection id.
        connection_id: ConnectionId,
        /// Peer endpoint.
        endpoint: SocketAddr,
        /// Payload with the frame tag stripped.
        payload: Bytes,
    },

    /// A connection went away.
    Disconnect {
        /// Connection id.
        connection_id: ConnectionId,
        /// Last known peer endpoint.
        endpoint: SocketAddr,
    },

    /// A reportable socket error. Does not tear the connection down by itself.
    Error {
        /// Endpoint involved, when known.
        endpoint: Option<SocketAddr>,
        /// The error.
        fault: SocketFault,
    },
}

impl TransportEvent {
    /// Build an error event from an I/O error.
    pub fn error(endpoint: Option<SocketAddr>, err: &io::Error) -> Self {
        TransportEvent::Error {
            endpoint,
            fault: SocketFault::from(err),
        }
    }

    /// The event kind.
    pub fn kind(&self) -> EventKind {
        match self {
            TransportEvent::Connect { .. } => EventKind::Connect,
            TransportEvent::Data { .. } => EventKind::Data,
            TransportEvent::Disconnect { .. } => EventKind::Disconnect,
            TransportEvent::Error { .. } => EventKind::Error,
        }
    }

    /// Connection the event belongs to. `None` for errors.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            TransportEvent::Connect { connection_id, .. }
            | TransportEvent::Data { connection_id, .. }
            | TransportEvent::Disconnect { connection_id, .. } => Some(*connection_id),
            TransportEvent::Error { .. } => None,
        }
    }

    /// Peer endpoint, when known.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        match self {
            TransportEvent::Connect { endpoint, .. }
            | TransportEvent::Data { endpoint, .. }
            | TransportEvent::Disconnect { endpoint, .. } => Some(*endpoint),
            TransportEvent::Error { endpoint, .. } => *endpoint,
        }
    }

    /// Payload of a data event.
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            TransportEvent::Data { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Take the payload out of a data event.
    pub fn into_payload(self) -> Option<Bytes> {
        match self {
            TransportEvent::Data { payload, .. } => Some(payload),
            _ => None,
        }
    }
}

/// Unbounded FIFO of events, safe for many producers and consumers.
///
/// `enqueue` never blocks; `try_dequeue` never blocks. A stalled consumer lets the backlog
/// grow without bound; nothing expires.
#[derive(Debug)]
pub struct EventQueue {
    tx: UnboundedSender<TransportEvent>,
    rx: Mutex<UnboundedReceiver<TransportEvent>>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Append an event.
    pub fn enqueue(&self, event: TransportEvent) {
        // The receiver lives as long as `self`, so sending cannot fail.
        let _ = self.tx.send(event);
    }

    /// Pop the oldest event, if any.
    pub fn try_dequeue(&self) -> Option<TransportEvent> {
        lock(&self.rx).try_recv().ok()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        lock(&self.rx).len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        lock(&self.rx).is_empty()
    }

    /// Drop every queued event.
    pub fn clear(&self) {
        let mut rx = lock(&self.rx);
        while rx.try_recv().is_ok() {}
    }
}
