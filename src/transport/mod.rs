//! Connection multiplexing over one shared datagram socket.
//!
//! This module implements the session layer around a per-connection ARQ engine:
//!
//! - **Framing**: [`Frame`], [`AcceptMessage`] and the connection id datagram prefix
//! - **Connections**: [`Connection`], [`ConnectionId`], [`IdAllocator`], [`ConnectionPhase`]
//! - **Registry**: [`Registry`], the `id <-> endpoint` table
//! - **Engines**: [`EngineSettings`], [`EngineOutput`], [`KcpEngineFactory`]
//! - **Dispatch**: [`Demultiplexer`] routing datagrams to engines and frames to events
//! - **Timing**: [`TickDriver`] advancing engines and reaping dead connections
//! - **Events**: [`TransportEvent`] and the [`EventQueue`] drained by the consumer
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  accept msg  ┌──────────────┐
//! │ control (TCP)│─────────────▶│  registry    │◀──── tick driver
//! └──────────────┘              └──────┬───────┘
//!                                      │ id
//! ┌──────────────┐  [id][bytes] ┌──────▼───────┐ frames ┌────────────┐
//! │  data (UDP)  │─────────────▶│ demultiplexer│───────▶│ event queue│──▶ consumer
//! └──────────────┘              └──────────────┘        └────────────┘
//! ```

mod connection;
mod demux;
mod engine;
mod events;
mod frame;
mod peer;
mod registry;
mod socket;
mod ticker;

pub use connection::{
    Connection, ConnectionHandle, ConnectionId, ConnectionPhase, EndpointCell, IdAllocator,
    SharedEngine,
};
pub use demux::{Demultiplexer, Role};
pub use engine::{EngineOutput, EngineSettings, KcpEngine, KcpEngineFactory};
pub use events::{EventKind, EventQueue, SocketFault, TransportEvent};
pub use frame::*;
pub use peer::Peer;
pub use registry::{Registry, SourceCheck};
pub use socket::{is_ignorable, ControlStream, DataSocket, Liveness};
pub use ticker::{HelloBeacon, TickDriver};
