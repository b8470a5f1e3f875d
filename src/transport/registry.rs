//! Connection registry.
//!
//! Bidirectional `id <-> endpoint` table plus per-connection state. Both indices live under
//! one lock so a half-registered connection is never observable.

use std::net::SocketAddr;
use std::sync::Mutex;

use rustc_hash::FxHashMap;
use tracing::debug;

use super::connection::{lock, Connection, ConnectionHandle, ConnectionId, ConnectionPhase};
use crate::core::RegistryError;

/// Outcome of checking a datagram's source against a connection's data endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCheck {
    /// Source matches the bound endpoint.
    Accepted,
    /// First datagram for this connection (or rebinding allowed): endpoint updated.
    Rebound,
    /// Source differs from the confirmed endpoint; datagram must be dropped.
    Rejected,
    /// No such connection.
    Unknown,
}

#[derive(Default)]
struct Tables {
    by_id: FxHashMap<ConnectionId, Connection>,
    by_endpoint: FxHashMap<SocketAddr, ConnectionId>,
}

impl Tables {
    fn rebind(&mut self, id: ConnectionId, addr: SocketAddr) -> Result<(), RegistryError> {
        if let Some(owner) = self.by_endpoint.get(&addr) {
            if *owner != id {
                return Err(RegistryError::DuplicateEndpoint(addr));
            }
        }
        let conn = self
            .by_id
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        let old = conn.endpoint();
        self.by_endpoint.remove(&old);
        self.by_endpoint.insert(addr, id);
        conn.bind_endpoint(addr);
        Ok(())
    }
}

/// Table of active connections, owned by one transport instance.
#[derive(Default)]
pub struct Registry {
    tables: Mutex<Tables>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection.
    ///
    /// Fails without modifying the table if the id or the endpoint is already present.
    pub fn add(&self, connection: Connection) -> Result<(), RegistryError> {
        let mut tables = lock(&self.tables);
        let id = connection.id();
        let endpoint = connection.endpoint();
        if tables.by_id.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        if tables.by_endpoint.contains_key(&endpoint) {
            return Err(RegistryError::DuplicateEndpoint(endpoint));
        }
        tables.by_endpoint.insert(endpoint, id);
        tables.by_id.insert(id, connection);
        Ok(())
    }

    /// Remove a connection, returning it marked `Closed`.
    ///
    /// Removing an absent id is a no-op returning `None`.
    pub fn remove(&self, id: ConnectionId) -> Option<Connection> {
        let mut tables = lock(&self.tables);
        let mut conn = tables.by_id.remove(&id)?;
        let endpoint = conn.endpoint();
        if tables.by_endpoint.get(&endpoint) == Some(&id) {
            tables.by_endpoint.remove(&endpoint);
        }
        conn.set_phase(ConnectionPhase::Closed);
        Some(conn)
    }

    /// Look up the connection bound to `endpoint`.
    pub fn find_by_endpoint(&self, endpoint: SocketAddr) -> Option<ConnectionId> {
        lock(&self.tables).by_endpoint.get(&endpoint).copied()
    }

    /// Look up a connection by id.
    pub fn find_by_id(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        lock(&self.tables).by_id.get(&id).map(Connection::handle)
    }

    /// Current phase of a connection.
    pub fn phase(&self, id: ConnectionId) -> Option<ConnectionPhase> {
        lock(&self.tables).by_id.get(&id).map(Connection::phase)
    }

    /// All current connections ordered by id.
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        let tables = lock(&self.tables);
        let mut handles: Vec<_> = tables.by_id.values().map(Connection::handle).collect();
        handles.sort_by_key(|h| h.id);
        handles
    }

    /// Move a connection into `phase`. Returns `false` for unknown ids.
    pub fn set_phase(&self, id: ConnectionId, phase: ConnectionPhase) -> bool {
        match lock(&self.tables).by_id.get_mut(&id) {
            Some(conn) => {
                conn.set_phase(phase);
                true
            }
            None => false,
        }
    }

    /// Transition a live connection to `Disconnecting`.
    ///
    /// Returns the connection's endpoint if this call performed the transition, `None` if the
    /// connection is unknown or already disconnecting. Exactly one caller wins.
    pub fn begin_disconnect(&self, id: ConnectionId) -> Option<SocketAddr> {
        let mut tables = lock(&self.tables);
        let conn = tables.by_id.get_mut(&id)?;
        if !conn.phase().is_live() {
            return None;
        }
        conn.set_phase(ConnectionPhase::Disconnecting);
        Some(conn.endpoint())
    }

    /// Explicitly re-bind a connection to a new endpoint.
    ///
    /// Both index entries move together; fails if `endpoint` belongs to another connection.
    pub fn rebind(&self, id: ConnectionId, endpoint: SocketAddr) -> Result<(), RegistryError> {
        lock(&self.tables).rebind(id, endpoint)
    }

    /// Check a datagram source for `id`, applying the rebinding policy.
    ///
    /// The first datagram observed for a connection binds its data endpoint. Later datagrams
    /// from another source are rejected unless `allow_rebinding` is set.
    pub fn observe_source(
        &self,
        id: ConnectionId,
        source: SocketAddr,
        allow_rebinding: bool,
    ) -> SourceCheck {
        let mut tables = lock(&self.tables);
        let Some(conn) = tables.by_id.get_mut(&id) else {
            return SourceCheck::Unknown;
        };
        if conn.endpoint() == source {
            conn.confirm_endpoint();
            return SourceCheck::Accepted;
        }
        if conn.endpoint_confirmed() && !allow_rebinding {
            return SourceCheck::Rejected;
        }
        match tables.rebind(id, source) {
            Ok(()) => {
                debug!("connection {} bound to {}", id, source);
                SourceCheck::Rebound
            }
            Err(_) => SourceCheck::Rejected,
        }
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        lock(&self.tables).by_id.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every connection, returning them for disposal.
    pub fn clear(&self) -> Vec<Connection> {
        let mut tables = lock(&self.tables);
        tables.by_endpoint.clear();
        tables
            .by_id
            .drain()
            .map(|(_, mut conn)| {
                conn.set_phase(ConnectionPhase::Closed);
                conn
            })
            .collect()
    }
}
