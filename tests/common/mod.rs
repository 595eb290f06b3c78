//! Shared fixtures for integration tests

#![allow(dead_code, clippy::unwrap_used)]

use netmsg_protocol::core::codec;
use netmsg_protocol::{
    Channel, ChannelRegistry, ConnectionHandle, ConnectionHandler, DhParams, Direction,
    FieldDescriptor, Message, MessageSchema, ProtocolError, Result,
};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const PLAIN: u8 = 1;
pub const SECURE: u8 = 2;

pub const PING: u16 = 1;
pub const TRANSFER: u16 = 2;
pub const PROFILE: u16 = 3;

/// Ping{timeMs u32}, Transfer{transId u32, count, data, idCount, ids u16[]},
/// Profile{level u8, score f32, ratio f64, tag[8], digest[4], name wide<16>}
pub fn schemas(direction: Direction) -> Vec<MessageSchema> {
    vec![
        MessageSchema::new(PING, "Ping", direction, vec![FieldDescriptor::u32("timeMs")]).unwrap(),
        MessageSchema::new(
            TRANSFER,
            "Transfer",
            direction,
            vec![
                FieldDescriptor::u32("transId"),
                FieldDescriptor::var_count("count", 1, 0, 256),
                FieldDescriptor::var_bytes("data"),
                FieldDescriptor::var_count("idCount", 2, 1, 8),
                FieldDescriptor::var_ptr("ids"),
            ],
        )
        .unwrap(),
        MessageSchema::new(
            PROFILE,
            "Profile",
            direction,
            vec![
                FieldDescriptor::u8("level"),
                FieldDescriptor::f32("score"),
                FieldDescriptor::f64("ratio"),
                FieldDescriptor::fixed_string("tag", 8),
                FieldDescriptor::fixed_data("digest", 4),
                FieldDescriptor::wide_string("name", 16),
            ],
        )
        .unwrap(),
    ]
}

pub fn schema(id: u16) -> MessageSchema {
    schemas(Direction::Send)
        .into_iter()
        .find(|s| s.id() == id)
        .unwrap()
}

/// Both sides of a plaintext and an encrypted protocol
pub fn registry() -> Arc<ChannelRegistry> {
    let mut builder = ChannelRegistry::builder();
    for (protocol_id, dh) in [(PLAIN, None), (SECURE, Some(DhParams::modp_2048()))] {
        for server_side in [true, false] {
            builder.register(
                protocol_id,
                server_side,
                schemas(Direction::Send),
                schemas(Direction::Recv),
                dh.clone(),
            );
        }
    }
    builder.build()
}

pub fn server_channel(protocol_id: u8) -> Arc<Channel> {
    registry().lookup(protocol_id, true).unwrap()
}

pub fn ping(time_ms: u64) -> Message {
    Message::builder(PING).uint(time_ms).build()
}

pub fn transfer(trans_id: u64, data: Vec<u8>, ids: &[u16]) -> Message {
    let raw: Vec<u8> = ids.iter().flat_map(|id| id.to_le_bytes()).collect();
    Message::builder(TRANSFER)
        .uint(trans_id)
        .var_bytes(data)
        .var_array(ids.len() as u32, raw)
        .build()
}

pub fn encode(message: &Message) -> Vec<u8> {
    codec::encode(&schema(message.id), message).unwrap().to_vec()
}

/// Events a handler observed, forwarded over a channel
#[derive(Debug)]
pub enum Event {
    Established(ConnectionHandle),
    Message(ConnectionHandle, Message),
    Error(ConnectionHandle, String),
    Disconnected(ConnectionHandle),
}

/// Handler that forwards every callback to a tokio channel
pub struct ChannelHandler {
    pub events: mpsc::UnboundedSender<Event>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }
}

impl ConnectionHandler for ChannelHandler {
    fn on_handshake_complete(&mut self, handle: ConnectionHandle) {
        let _ = self.events.send(Event::Established(handle));
    }

    fn on_message(&mut self, handle: ConnectionHandle, message: Message) -> Result<()> {
        self.events
            .send(Event::Message(handle, message))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn on_error(&mut self, handle: ConnectionHandle, error: &ProtocolError) {
        let _ = self.events.send(Event::Error(handle, format!("{error:?}")));
    }

    fn on_disconnected(&mut self, handle: ConnectionHandle) {
        let _ = self.events.send(Event::Disconnected(handle));
    }
}
