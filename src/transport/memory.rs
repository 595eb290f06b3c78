//! In-memory transport.
//!
//! Records every write per handle so callers can inspect or forward the exact wire bytes.
//! Used by the test suite to pump bytes between a client and a server connection without
//! sockets.

use crate::error::{ProtocolError, Result};
use crate::transport::{ConnectionHandle, Transport};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Wire {
    written: BytesMut,
    writes: usize,
    closed: Option<bool>,
}

/// Transport that keeps written bytes in memory
#[derive(Debug, Default)]
pub struct MemoryTransport {
    wires: Mutex<HashMap<ConnectionHandle, Wire>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn wires(&self) -> MutexGuard<'_, HashMap<ConnectionHandle, Wire>> {
        self.wires.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove and return everything written to `handle` so far
    pub fn take_bytes(&self, handle: ConnectionHandle) -> Bytes {
        self.wires()
            .get_mut(&handle)
            .map(|wire| wire.written.split().freeze())
            .unwrap_or_default()
    }

    /// Number of `send` calls seen for `handle`
    pub fn write_count(&self, handle: ConnectionHandle) -> usize {
        self.wires().get(&handle).map_or(0, |wire| wire.writes)
    }

    /// `Some(hard)` once `handle` was disconnected
    pub fn disconnected(&self, handle: ConnectionHandle) -> Option<bool> {
        self.wires().get(&handle).and_then(|wire| wire.closed)
    }
}

impl Transport for MemoryTransport {
    fn send(&self, handle: ConnectionHandle, bytes: Bytes) -> Result<()> {
        let mut wires = self.wires();
        let wire = wires.entry(handle).or_default();
        if wire.closed.is_some() {
            return Err(ProtocolError::ConnectionClosed);
        }
        wire.written.extend_from_slice(&bytes);
        wire.writes += 1;
        Ok(())
    }

    fn disconnect(&self, handle: ConnectionHandle, hard: bool) {
        self.wires().entry(handle).or_default().closed.get_or_insert(hard);
    }
}
