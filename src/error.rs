//! # Error Types
//!
//! Error handling for the message protocol layer.
//!
//! Every failure that can occur while framing, decoding, negotiating a session or
//! flushing outbound bytes is expressed as a [`ProtocolError`] value.
//!
//! ## Error Categories
//! - **Connection-fatal**: framing errors, unknown message ids, handshake failures,
//!   cipher desynchronization and resource exhaustion. These close the connection and
//!   are surfaced exactly once through the connection's error callback.
//! - **Caller errors**: values that do not match their schema, sends before the session
//!   is established, sends on closed connections. Returned to the caller; the connection
//!   stays usable.
//! - **Ambient**: I/O and configuration problems.
//!
//! ## Example Usage
//! ```rust
//! use netmsg_protocol::error::{ProtocolError, Result};
//!
//! fn check_count(count: u32, max: u32) -> Result<u32> {
//!     if count > max {
//!         return Err(ProtocolError::Framing(format!("count {count} exceeds {max}")));
//!     }
//!     Ok(count)
//! }
//!
//! assert!(check_count(3, 2).unwrap_err().is_connection_fatal());
//! ```

use std::fmt;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Framing errors
    pub const ERR_TRUNCATED_FRAME: &str = "Frame ended before all fields were read";
    pub const ERR_TRAILING_BYTES: &str = "Frame has bytes after the last field";
    pub const ERR_COUNT_OVERFLOW: &str = "Variable field size overflows";
    pub const ERR_INVALID_UTF8: &str = "String field is not valid UTF-8";
    pub const ERR_INVALID_UTF16: &str = "Wide string field is not valid UTF-16";

    /// Value errors
    pub const ERR_FIELD_COUNT_MISMATCH: &str = "Message field count does not match schema";
    pub const ERR_COUNT_PAYLOAD_MISMATCH: &str = "Variable payload length does not match its count";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_SEND_FAILED: &str = "Transport write failed, queued bytes were not sent";

    /// Cryptographic errors
    pub const ERR_KEYSTREAM_EXHAUSTED: &str = "Stream cipher keystream exhausted";
}

/// Reason a handshake was abandoned.
///
/// The numeric [`code`](HandshakeFailure::code) travels in the server's error reply so a
/// client can report why it was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// Hello named a protocol with no registered channel
    UnknownProtocol(u8),
    /// Peer DH public value outside `[1, modulus - 1]`
    DhValueOutOfRange,
    /// Handshake packet could not be parsed
    MalformedPacket,
    /// Handshake packet arrived in a state that does not expect it
    UnexpectedPacket,
    /// Server refused the hello and sent back a reason code
    PeerRejected(u32),
    /// Channel requires encryption but the peer negotiated plaintext
    EncryptionRequired,
    /// Session was not established before the caller's deadline
    Timeout,
}

impl HandshakeFailure {
    /// Wire code sent in the server error reply
    pub fn code(&self) -> u32 {
        match self {
            HandshakeFailure::UnknownProtocol(_) => 1,
            HandshakeFailure::DhValueOutOfRange => 2,
            HandshakeFailure::MalformedPacket => 3,
            HandshakeFailure::UnexpectedPacket => 4,
            HandshakeFailure::PeerRejected(code) => *code,
            HandshakeFailure::EncryptionRequired => 5,
            HandshakeFailure::Timeout => 6,
        }
    }
}

impl fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeFailure::UnknownProtocol(id) => write!(f, "unknown protocol id {id}"),
            HandshakeFailure::DhValueOutOfRange => f.write_str("DH public value out of range"),
            HandshakeFailure::MalformedPacket => f.write_str("malformed handshake packet"),
            HandshakeFailure::UnexpectedPacket => f.write_str("unexpected handshake packet"),
            HandshakeFailure::PeerRejected(code) => write!(f, "peer rejected handshake (code {code})"),
            HandshakeFailure::EncryptionRequired => f.write_str("peer refused encryption"),
            HandshakeFailure::Timeout => f.write_str("handshake timed out"),
        }
    }
}

// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Unknown message id: {0}")]
    UnknownMessageId(u16),

    #[error("Handshake failed: {0}")]
    Handshake(HandshakeFailure),

    #[error("Cipher desynchronized: {0}")]
    CryptoDesync(String),

    #[error("Receive buffer exhausted: {required} bytes required, limit {limit}")]
    ResourceExhausted { required: usize, limit: usize },

    #[error("Invalid message value: {0}")]
    InvalidValue(String),

    #[error("Invalid message schema: {0}")]
    InvalidSchema(String),

    #[error("No send schema for message id {0}")]
    UnknownSendMessage(u16),

    #[error("Message handler rejected message id {0}")]
    DispatchFailed(u16),

    #[error("Session not established")]
    NotEstablished,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProtocolError {
    /// Whether this error terminates the connection it occurred on
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Framing(_)
                | ProtocolError::UnknownMessageId(_)
                | ProtocolError::Handshake(_)
                | ProtocolError::CryptoDesync(_)
                | ProtocolError::ResourceExhausted { .. }
                | ProtocolError::DispatchFailed(_)
        )
    }
}

impl From<HandshakeFailure> for ProtocolError {
    fn from(reason: HandshakeFailure) -> Self {
        ProtocolError::Handshake(reason)
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
