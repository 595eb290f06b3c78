//! # Protocol Layer
//!
//! Channels, session handshake, cipher state, receive reassembly, send batching and the
//! per-connection state machine that ties them together.
//!
//! ## Components
//! - **Registry**: build-once `(protocol_id, server_side) -> Channel` table
//! - **Crypto**: finite-field Diffie-Hellman and per-direction ChaCha20 streams
//! - **Handshake**: hello/reply packets and the pure key-agreement steps
//! - **Accumulator**: message boundary recovery from arbitrary chunks
//! - **Scheduler**: per-connection send buffers and the shared flush timer
//! - **Connection**: handshake state machine and message send/receive

pub mod accumulator;
pub mod connection;
pub mod crypto;
pub mod handshake;
pub mod registry;
pub mod scheduler;

#[cfg(test)]
mod tests;
