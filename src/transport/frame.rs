//! Frame and datagram encoding.
//!
//! Two layers of framing exist:
//!
//! - **Datagrams** on the shared data channel carry a connection id prefix followed by
//!   engine bytes (or, for id `0`, a raw handshake frame).
//! - **Frames** are what engines deliver: a one-byte tag followed by a body.
//!
//! ```text
//! datagram:  +----------------+---------------------------+
//!            | conn id (LE32) | engine bytes / raw frame  |
//!            +----------------+---------------------------+
//! frame:     +-----+--------------------------------------+
//!            | tag | body                                 |
//!            +-----+--------------------------------------+
//! ```

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use super::connection::ConnectionId;
use crate::core::constants::{
    ACCEPT_MESSAGE_SIZE, CONNECTION_PREFIX_SIZE, FRAME_TAG_CONNECT, FRAME_TAG_DATA,
    FRAME_TAG_DISCONNECT,
};

/// Errors that can occur while decoding frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Zero-length frame.
    #[error("empty frame")]
    Empty,

    /// Tag byte is not a known frame type.
    #[error("unknown frame tag 0x{0:02x}")]
    UnknownTag(u8),

    /// Not enough bytes for the fixed part of the frame.
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    TooShort {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Advertised port is outside the valid range.
    #[error("invalid port {0}")]
    InvalidPort(i32),
}

/// Frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Connection established / hello.
    Connect = FRAME_TAG_CONNECT,
    /// Application payload.
    Data = FRAME_TAG_DATA,
    /// Graceful teardown.
    Disconnect = FRAME_TAG_DISCONNECT,
}

impl FrameType {
    /// Parse frame type from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            FRAME_TAG_CONNECT => Some(Self::Connect),
            FRAME_TAG_DATA => Some(Self::Data),
            FRAME_TAG_DISCONNECT => Some(Self::Disconnect),
            _ => None,
        }
    }

    /// Convert frame type to its byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A decoded frame borrowing its body from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Connect frame; the body is an accept message (server to client) or
    /// optional trailing bytes (hello).
    Connect(&'a [u8]),
    /// Data frame with the tag stripped.
    Data(&'a [u8]),
    /// Disconnect frame. Any body is ignored.
    Disconnect,
}

impl<'a> Frame<'a> {
    /// Classify a frame by its tag byte.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, FrameError> {
        let (&tag, body) = bytes.split_first().ok_or(FrameError::Empty)?;
        match FrameType::from_byte(tag) {
            Some(FrameType::Connect) => Ok(Frame::Connect(body)),
            Some(FrameType::Data) => Ok(Frame::Data(body)),
            Some(FrameType::Disconnect) => Ok(Frame::Disconnect),
            None => Err(FrameError::UnknownTag(tag)),
        }
    }

    /// The frame type.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect(_) => FrameType::Connect,
            Frame::Data(_) => FrameType::Data,
            Frame::Disconnect => FrameType::Disconnect,
        }
    }
}

/// Build a frame: tag followed by `body`.
pub fn encode_frame(frame_type: FrameType, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(1 + body.len());
    buf.put_u8(frame_type.as_byte());
    buf.put_slice(body);
    buf
}

/// Prefix `body` with a connection id, producing a data-channel datagram.
pub fn encode_datagram(connection_id: u32, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(CONNECTION_PREFIX_SIZE + body.len());
    buf.put_u32_le(connection_id);
    buf.put_slice(body);
    buf
}

/// Split a data-channel datagram into its connection id prefix and the remaining bytes.
///
/// Returns `None` for datagrams too short to carry a prefix.
pub fn split_datagram(datagram: &[u8]) -> Option<(u32, &[u8])> {
    if datagram.len() < CONNECTION_PREFIX_SIZE {
        return None;
    }
    let (prefix, rest) = datagram.split_at(CONNECTION_PREFIX_SIZE);
    let id = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    Some((id, rest))
}

/// Accept message handed to a client once its connection id has been allocated.
///
/// Wire format (9 bytes):
/// ```text
/// +--------+------------------+------------------+
/// | 0x00   | conn id (LE u32) | data port (LE32) |
/// +--------+------------------+------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptMessage {
    /// Id the client must use for every datagram.
    pub connection_id: ConnectionId,
    /// Port of the server's shared data socket.
    pub data_port: u16,
}

impl AcceptMessage {
    /// Create a new accept message.
    pub fn new(connection_id: ConnectionId, data_port: u16) -> Self {
        Self {
            connection_id,
            data_port,
        }
    }

    /// Encode including the Connect tag.
    pub fn encode(&self) -> [u8; ACCEPT_MESSAGE_SIZE] {
        let mut out = [0u8; ACCEPT_MESSAGE_SIZE];
        out[0] = FRAME_TAG_CONNECT;
        out[1..5].copy_from_slice(&self.connection_id.get().to_le_bytes());
        out[5..9].copy_from_slice(&i32::from(self.data_port).to_le_bytes());
        out
    }

    /// Decode the body of a Connect frame (tag already stripped).
    pub fn decode_body(body: &[u8]) -> Result<Self, FrameError> {
        if body.len() < ACCEPT_MESSAGE_SIZE - 1 {
            return Err(FrameError::TooShort {
                expected: ACCEPT_MESSAGE_SIZE - 1,
                actual: body.len(),
            });
        }
        let id = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        let port = i32::from_le_bytes([body[4], body[5], body[6], body[7]]);
        let data_port = u16::try_from(port).map_err(|_| FrameError::InvalidPort(port))?;
        Ok(Self::new(ConnectionId::new(id), data_port))
    }
}
