//! # netmsg-protocol
//!
//! Schema-driven binary messaging with Diffie-Hellman negotiated stream encryption.
//!
//! Upper protocol layers describe their messages once as [`MessageSchema`]s, group them into
//! channels in a frozen [`ChannelRegistry`], and exchange tagged [`Message`] values over a
//! [`Connection`]. The crate handles framing, handshake, key agreement, per-direction
//! encryption, message reassembly and batched sends.
//!
//! ## Layout
//! - [`core`]: schemas, message values and the codec
//! - [`protocol`]: registry, handshake, crypto, accumulator, scheduler, connection
//! - [`transport`]: the transport seam plus in-memory and TCP implementations
//! - [`config`], [`error`], [`utils`]: ambient concerns
//!
//! ## Example
//! ```rust
//! use netmsg_protocol::core::codec;
//! use netmsg_protocol::{Direction, FieldDescriptor, Message, MessageSchema};
//!
//! let ping = MessageSchema::new(1, "Ping", Direction::Send, vec![FieldDescriptor::u32("timeMs")])
//!     .unwrap();
//! let bytes = codec::encode(&ping, &Message::builder(1).uint(42).build()).unwrap();
//! assert_eq!(&bytes[..], &[0x01, 0x00, 0x2A, 0x00, 0x00, 0x00]);
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use crate::config::NetworkConfig;
pub use crate::core::message::{FieldValue, Message, MessageBuilder, NetMessage};
pub use crate::core::schema::{Direction, FieldDescriptor, FieldKind, MessageSchema};
pub use crate::error::{HandshakeFailure, ProtocolError, Result};
pub use crate::protocol::connection::{
    Connection, ConnectionHandler, ConnectionOptions, HandshakeState,
};
pub use crate::protocol::crypto::DhParams;
pub use crate::protocol::registry::{Channel, ChannelRegistry, ChannelRegistryBuilder};
pub use crate::protocol::scheduler::{SendQueue, SendScheduler};
pub use crate::transport::{ConnectionHandle, Transport};
