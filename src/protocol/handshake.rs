//! Session handshake: packets and the pure key-agreement steps.
//!
//! ```text
//! client                                   server
//!   | -- Hello{protocol_id, g^a mod n} -->   |  lookup channel, check range
//!   |                                        |  k = (g^a)^b, derive keys
//!   | <-- Reply::PublicValue{g^b mod n} --   |  -> Encrypted
//!   |  k = (g^b)^a, derive keys              |
//!   |  -> Encrypted                          |
//! ```
//!
//! On failure the server answers with `Reply::Error{reason}` instead and closes.
//!
//! Handshake state lives in per-connection values ([`ClientHandshake`]) passed through the
//! flow, never in globals, so concurrent handshakes cannot interfere.
//!
//! ## Wire format
//! ```text
//! Hello:  [protocol_id u8] [len u16 LE] [len bytes big-endian DH value]
//! Reply:  [0x01] [len u16 LE] [len bytes big-endian DH value]
//!         [0x02] [reason u32 LE]
//! ```
//! A zero length stands for "no value" and is only valid on plaintext channels.

use crate::error::{HandshakeFailure, Result};
use crate::protocol::crypto::{DhKeyPair, Encryptor, Role, SessionKeys};
use crate::protocol::registry::{Channel, ChannelRegistry};
use crate::utils::metrics::Timer;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_bigint::BigUint;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Largest DH public value accepted on the wire (8192-bit groups)
pub const MAX_DH_VALUE_BYTES: usize = 1024;

const HELLO_HEADER_LEN: usize = 3;
const REPLY_PUBLIC_VALUE: u8 = 0x01;
const REPLY_ERROR: u8 = 0x02;

/// First packet on every connection, client to server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub protocol_id: u8,
    pub dh_public: Option<BigUint>,
}

impl ClientHello {
    pub fn encode(&self) -> Bytes {
        let value = self
            .dh_public
            .as_ref()
            .map(BigUint::to_bytes_be)
            .unwrap_or_default();
        let mut out = BytesMut::with_capacity(HELLO_HEADER_LEN + value.len());
        out.put_u8(self.protocol_id);
        out.put_u16_le(value.len() as u16);
        out.put_slice(&value);
        out.freeze()
    }

    /// Parse a hello from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the packet is incomplete, otherwise the hello and the
    /// number of bytes it occupied.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < HELLO_HEADER_LEN {
            return Ok(None);
        }
        let mut header = &buf[..HELLO_HEADER_LEN];
        let protocol_id = header.get_u8();
        let len = usize::from(header.get_u16_le());

        let Some((dh_public, used)) = read_value(&buf[HELLO_HEADER_LEN..], len)? else {
            return Ok(None);
        };
        Ok(Some((
            Self {
                protocol_id,
                dh_public,
            },
            HELLO_HEADER_LEN + used,
        )))
    }
}

/// Server answer to a hello
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerReply {
    /// Server public value, `None` on plaintext channels
    PublicValue(Option<BigUint>),
    /// Rejection with a [`HandshakeFailure::code`]
    Error(u32),
}

impl ServerReply {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        match self {
            ServerReply::PublicValue(value) => {
                let value = value.as_ref().map(BigUint::to_bytes_be).unwrap_or_default();
                out.reserve(HELLO_HEADER_LEN + value.len());
                out.put_u8(REPLY_PUBLIC_VALUE);
                out.put_u16_le(value.len() as u16);
                out.put_slice(&value);
            }
            ServerReply::Error(reason) => {
                out.put_u8(REPLY_ERROR);
                out.put_u32_le(*reason);
            }
        }
        out.freeze()
    }

    /// Parse a reply from the front of `buf`, `Ok(None)` while incomplete
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some(&kind) = buf.first() else {
            return Ok(None);
        };
        match kind {
            REPLY_PUBLIC_VALUE => {
                if buf.len() < HELLO_HEADER_LEN {
                    return Ok(None);
                }
                let len = usize::from((&buf[1..HELLO_HEADER_LEN]).get_u16_le());
                Ok(read_value(&buf[HELLO_HEADER_LEN..], len)?.map(|(value, used)| {
                    (ServerReply::PublicValue(value), HELLO_HEADER_LEN + used)
                }))
            }
            REPLY_ERROR => {
                if buf.len() < 5 {
                    return Ok(None);
                }
                let reason = (&buf[1..5]).get_u32_le();
                Ok(Some((ServerReply::Error(reason), 5)))
            }
            _ => Err(HandshakeFailure::MalformedPacket.into()),
        }
    }
}

fn read_value(buf: &[u8], len: usize) -> Result<Option<(Option<BigUint>, usize)>> {
    if len > MAX_DH_VALUE_BYTES {
        return Err(HandshakeFailure::MalformedPacket.into());
    }
    if buf.len() < len {
        return Ok(None);
    }
    let value = (len > 0).then(|| BigUint::from_bytes_be(&buf[..len]));
    Ok(Some((value, len)))
}

/// Client state between sending the hello and receiving the reply
#[derive(Debug)]
pub struct ClientHandshake {
    channel: Arc<Channel>,
    keypair: Option<DhKeyPair>,
}

impl ClientHandshake {
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }
}

/// Begin a client handshake on `channel`, returning the state and the hello to send
#[instrument(skip(channel), fields(protocol_id = channel.protocol_id()))]
pub fn client_start(channel: Arc<Channel>) -> (ClientHandshake, ClientHello) {
    let keypair = channel.dh().map(|params| params.generate_keypair());
    let hello = ClientHello {
        protocol_id: channel.protocol_id(),
        dh_public: keypair.as_ref().map(|pair| pair.public().clone()),
    };
    debug!(encrypted = keypair.is_some(), "client sending hello");
    (ClientHandshake { channel, keypair }, hello)
}

/// Outcome of a server accepting a hello
#[derive(Debug)]
pub struct ServerAccept {
    pub channel: Arc<Channel>,
    pub reply: ServerReply,
    pub encryptor: Encryptor,
}

/// Validate a hello against the registry and agree on session keys.
///
/// # Errors
/// `UnknownProtocol` when no server-side channel exists for the id, `EncryptionRequired`
/// when the channel has DH parameters but the hello carries no value, and
/// `DhValueOutOfRange` when the client value is not in `[1, modulus - 1]`.
#[instrument(skip(registry, hello), fields(protocol_id = hello.protocol_id))]
pub fn server_accept_hello(registry: &ChannelRegistry, hello: &ClientHello) -> Result<ServerAccept> {
    let channel = registry
        .lookup(hello.protocol_id, true)
        .ok_or(HandshakeFailure::UnknownProtocol(hello.protocol_id))?;

    let Some(params) = channel.dh() else {
        debug!("plaintext channel, skipping key agreement");
        return Ok(ServerAccept {
            channel,
            reply: ServerReply::PublicValue(None),
            encryptor: Encryptor::plaintext(),
        });
    };

    let client_public = hello
        .dh_public
        .as_ref()
        .ok_or(HandshakeFailure::EncryptionRequired)?;
    if !params.accepts(client_public) {
        warn!("client DH value out of range");
        return Err(HandshakeFailure::DhValueOutOfRange.into());
    }

    let _timer = Timer::start("server_key_agreement");
    let keypair = params.generate_keypair();
    let shared = keypair.shared_secret(params, client_public)?;
    let encryptor = Encryptor::from_keys(&SessionKeys::derive(&shared, Role::Server));
    debug!("server derived session keys");

    Ok(ServerAccept {
        reply: ServerReply::PublicValue(Some(keypair.public().clone())),
        channel,
        encryptor,
    })
}

/// Complete a client handshake with the server's reply.
///
/// # Errors
/// `PeerRejected` for error replies, `EncryptionRequired` when the channel expects a DH
/// value and the reply is empty, `UnexpectedPacket` when a plaintext channel receives a
/// value, and `DhValueOutOfRange` for server values outside `[1, modulus - 1]`.
#[instrument(skip_all, fields(protocol_id = state.channel.protocol_id()))]
pub fn client_finish(state: ClientHandshake, reply: &ServerReply) -> Result<Encryptor> {
    let server_public = match reply {
        ServerReply::Error(code) => {
            warn!(code, "server rejected handshake");
            return Err(HandshakeFailure::PeerRejected(*code).into());
        }
        ServerReply::PublicValue(value) => value.as_ref(),
    };

    match (state.channel.dh(), state.keypair.as_ref(), server_public) {
        (None, _, None) => Ok(Encryptor::plaintext()),
        (None, _, Some(_)) => Err(HandshakeFailure::UnexpectedPacket.into()),
        (Some(_), _, None) => Err(HandshakeFailure::EncryptionRequired.into()),
        (Some(params), Some(keypair), Some(server_public)) => {
            let _timer = Timer::start("client_key_agreement");
            let shared = keypair.shared_secret(params, server_public)?;
            debug!("client derived session keys");
            Ok(Encryptor::from_keys(&SessionKeys::derive(
                &shared,
                Role::Client,
            )))
        }
        (Some(_), None, Some(_)) => Err(HandshakeFailure::UnexpectedPacket.into()),
    }
}
