//! Error types for the transport.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::transport::ConnectionId;

/// Errors reported by an ARQ engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine refused the operation (bad segment, oversized message, ...).
    #[error("engine rejected operation: {0}")]
    Rejected(String),

    /// Writing engine output failed.
    #[error("engine output failed: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised by the connection registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The connection id is already registered.
    #[error("duplicate connection id {0}")]
    DuplicateId(ConnectionId),

    /// The endpoint is already mapped to another connection.
    #[error("endpoint {0} already registered")]
    DuplicateEndpoint(SocketAddr),

    /// No connection with this id.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

/// Invalid engine or driver settings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
    /// MTU cannot hold the connection prefix and engine header.
    #[error("mtu {mtu} is below the minimum of {min}")]
    MtuTooSmall {
        /// Configured MTU.
        mtu: usize,
        /// Smallest usable MTU.
        min: usize,
    },

    /// A window size of zero would stall the engine.
    #[error("send and receive windows must be non-zero")]
    ZeroWindow,

    /// The engine interval must be positive.
    #[error("engine interval must be non-zero")]
    ZeroInterval,

    /// A server must accept at least one connection.
    #[error("max connections must be non-zero")]
    ZeroCapacity,
}

/// Top-level transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Binding the data socket or control listener failed.
    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Settings failed validation.
    #[error("invalid settings: {0}")]
    Settings(#[from] SettingsError),

    /// Registry rejected an operation.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The ARQ engine failed.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// No connection with this id.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// The client has not received its connection id yet, or the connection is not
    /// in the connected phase.
    #[error("not connected")]
    NotConnected,

    /// The transport has not been started.
    #[error("transport not started")]
    NotStarted,

    /// The transport is already running.
    #[error("transport already started")]
    AlreadyStarted,

    /// All connection ids of this instance have been handed out.
    #[error("connection ids exhausted")]
    IdsExhausted,

    /// The server is at capacity.
    #[error("server full ({0} connections)")]
    CapacityReached(usize),

    /// Host name resolution failed or yielded no usable address.
    #[error("cannot resolve {0}")]
    Resolve(String),

    /// Establishing the control stream timed out.
    #[error("connect timed out")]
    ConnectTimeout,
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
