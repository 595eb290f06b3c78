//! # Transport Layer
//!
//! The byte-moving collaborator underneath [`Connection`](crate::protocol::connection::Connection).
//!
//! A transport only has to accept outbound bytes for a handle and close handles on request.
//! Inbound bytes and disconnect notices are delivered by whoever owns the connection, by
//! calling `Connection::on_bytes_received` and `Connection::on_disconnected` serially.
//!
//! ## Implementations
//! - **Memory**: in-process recorder for tests and simulations
//! - **TCP**: tokio sockets with one driver task per connection

pub mod memory;
pub mod tcp;

use crate::error::Result;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier of one transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

impl ConnectionHandle {
    /// Allocate a process-unique handle
    pub fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Outbound side of a transport.
///
/// Implementations must not block: `send` is called from the flush timer and from
/// connection callbacks while a send buffer lock is held.
pub trait Transport: Send + Sync {
    /// Queue `bytes` for writing on `handle`, preserving call order per handle
    fn send(&self, handle: ConnectionHandle, bytes: Bytes) -> Result<()>;

    /// Close `handle`. A graceful close writes everything already passed to `send`
    /// first; a hard close may drop it.
    fn disconnect(&self, handle: ConnectionHandle, hard: bool);
}
