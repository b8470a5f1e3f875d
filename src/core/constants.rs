//! Wire and tuning constants.
//!
//! Wire values are shared with every peer speaking this transport and MUST NOT be changed.
//! Tuning defaults match the values deployed hosts have historically been configured with.

use std::time::Duration;

// =============================================================================
// FRAME TAGS
// =============================================================================

/// Connect frame: `[0x00][u32 connection id][i32 data port]` (server to client),
/// or a bare hello (client to server, out of band).
pub const FRAME_TAG_CONNECT: u8 = 0x00;

/// Data frame: `[0x01][application bytes...]`.
pub const FRAME_TAG_DATA: u8 = 0x01;

/// Disconnect frame: `[0x02]`, no body.
pub const FRAME_TAG_DISCONNECT: u8 = 0x02;

// =============================================================================
// WIRE SIZES
// =============================================================================

/// Width of the connection id prefix on every data-channel datagram.
pub const CONNECTION_PREFIX_SIZE: usize = 4;

/// Size of the accept message (tag + connection id + port).
pub const ACCEPT_MESSAGE_SIZE: usize = 1 + 4 + 4;

/// Connection id carried by out-of-band handshake datagrams.
pub const UNASSIGNED_CONNECTION_ID: u32 = 0;

/// First connection id handed out by an allocator.
pub const FIRST_CONNECTION_ID: u32 = 1;

/// Receive buffer size for the shared data socket.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Fixed per-segment overhead of the KCP engine.
pub const KCP_OVERHEAD: usize = 24;

/// Smallest MTU accepted by [`EngineSettings::validate`](crate::transport::EngineSettings::validate).
pub const MIN_MTU: usize = 64;

// =============================================================================
// ENGINE DEFAULTS
// =============================================================================

/// Engine internal update interval.
pub const DEFAULT_ENGINE_INTERVAL_MS: u32 = 100;

/// Engine send window, in segments.
pub const DEFAULT_SEND_WINDOW: u16 = 32;

/// Engine receive window, in segments.
pub const DEFAULT_RECEIVE_WINDOW: u16 = 32;

/// Datagram MTU, prefix included.
pub const DEFAULT_MTU: usize = 1400;

// =============================================================================
// DRIVER DEFAULTS
// =============================================================================

/// Cadence of the tick/liveness loop.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(10);

/// Interval between hello datagrams while a datagram-handshake client waits for its id.
pub const DEFAULT_HELLO_INTERVAL: Duration = Duration::from_millis(200);

/// Timeout for establishing the control stream.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound of datagrams drained by a single consumer poll.
pub const DEFAULT_MAX_DATAGRAMS_PER_POLL: usize = 256;

/// Default server capacity.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;
