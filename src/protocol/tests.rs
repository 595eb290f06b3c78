// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use crate::config::SchedulerConfig;
use crate::core::message::Message;
use crate::core::schema::{Direction, FieldDescriptor, MessageSchema};
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::{
    Connection, ConnectionHandler, ConnectionOptions, HandshakeState,
};
use crate::protocol::crypto::DhParams;
use crate::protocol::registry::ChannelRegistry;
use crate::protocol::scheduler::SendScheduler;
use crate::transport::memory::MemoryTransport;
use crate::transport::{ConnectionHandle, Transport};
use std::sync::Arc;
use std::time::Duration;

const PLAIN: u8 = 1;
const SECURE: u8 = 2;

#[derive(Default)]
struct Recorder {
    established: usize,
    messages: Vec<Message>,
    errors: Vec<String>,
    reject_messages: bool,
    disconnected: bool,
}

impl ConnectionHandler for Recorder {
    fn on_handshake_complete(&mut self, _handle: ConnectionHandle) {
        self.established += 1;
    }

    fn on_message(&mut self, _handle: ConnectionHandle, message: Message) -> Result<()> {
        if self.reject_messages {
            return Err(ProtocolError::InvalidValue("rejected".into()));
        }
        self.messages.push(message);
        Ok(())
    }

    fn on_error(&mut self, _handle: ConnectionHandle, error: &ProtocolError) {
        self.errors.push(format!("{error:?}"));
    }

    fn on_disconnected(&mut self, _handle: ConnectionHandle) {
        self.disconnected = true;
    }
}

fn schemas(direction: Direction) -> Vec<MessageSchema> {
    vec![
        MessageSchema::new(1, "Ping", direction, vec![FieldDescriptor::u32("timeMs")]).unwrap(),
        MessageSchema::new(
            2,
            "Blob",
            direction,
            vec![
                FieldDescriptor::var_count("count", 1, 0, 16),
                FieldDescriptor::var_bytes("data"),
            ],
        )
        .unwrap(),
    ]
}

fn registry() -> Arc<ChannelRegistry> {
    let mut builder = ChannelRegistry::builder();
    for (protocol_id, dh) in [(PLAIN, None), (SECURE, Some(DhParams::modp_2048()))] {
        builder
            .register(
                protocol_id,
                true,
                schemas(Direction::Send),
                schemas(Direction::Recv),
                dh.clone(),
            )
            .register(
                protocol_id,
                false,
                schemas(Direction::Send),
                schemas(Direction::Recv),
                dh,
            );
    }
    builder.build()
}

struct Pair {
    transport: Arc<MemoryTransport>,
    scheduler: Arc<SendScheduler>,
    client: Connection<Recorder>,
    server: Connection<Recorder>,
}

impl Pair {
    fn open(protocol_id: u8, server_options: ConnectionOptions) -> Self {
        let registry = registry();
        let transport = Arc::new(MemoryTransport::new());
        let scheduler = SendScheduler::new(&SchedulerConfig::default());
        let server = Connection::accept(
            Arc::clone(&registry),
            ConnectionHandle::next(),
            &scheduler,
            transport.clone(),
            Recorder::default(),
            server_options,
        );
        let client = Connection::connect(
            registry,
            protocol_id,
            ConnectionHandle::next(),
            &scheduler,
            transport.clone(),
            Recorder::default(),
            ConnectionOptions::default(),
        )
        .unwrap();
        Self {
            transport,
            scheduler,
            client,
            server,
        }
    }

    fn client_to_server(&mut self) -> HandshakeState {
        let bytes = self.transport.take_bytes(self.client.handle());
        self.server.on_bytes_received(&bytes)
    }

    fn server_to_client(&mut self) -> HandshakeState {
        let bytes = self.transport.take_bytes(self.server.handle());
        self.client.on_bytes_received(&bytes)
    }

    fn handshake(&mut self) {
        assert_eq!(self.client_to_server(), HandshakeState::Encrypted);
        assert_eq!(self.server_to_client(), HandshakeState::Encrypted);
    }
}

fn ping(time_ms: u64) -> Message {
    Message::builder(1).uint(time_ms).build()
}

#[test]
fn test_plaintext_ping_wire_bytes() {
    let mut pair = Pair::open(PLAIN, ConnectionOptions::default());
    assert_eq!(pair.client.state(), HandshakeState::AwaitingPeerDhValue);
    pair.handshake();

    pair.client.send_message_now(&ping(42)).unwrap();
    let wire = pair.transport.take_bytes(pair.client.handle());
    assert_eq!(&wire[..], &[0x01, 0x00, 0x2A, 0x00, 0x00, 0x00]);

    pair.server.on_bytes_received(&wire);
    assert_eq!(pair.server.handler().messages, vec![ping(42)]);
}

#[test]
fn test_encrypted_session_round_trip() {
    let mut pair = Pair::open(SECURE, ConnectionOptions::default());
    pair.handshake();
    assert_eq!(pair.client.handler().established, 1);
    assert_eq!(pair.server.handler().established, 1);
    assert_eq!(
        pair.client.encryptor().outbound_fingerprint(),
        pair.server.encryptor().inbound_fingerprint()
    );

    pair.client.send_message(&ping(42)).unwrap();
    pair.client.send_message(&ping(43)).unwrap();
    pair.client.flush().unwrap();
    let wire = pair.transport.take_bytes(pair.client.handle());
    assert_eq!(wire.len(), 12);
    assert_ne!(&wire[..6], &[0x01, 0x00, 0x2A, 0x00, 0x00, 0x00]);

    // deliver one byte at a time
    for byte in wire.iter() {
        pair.server.on_bytes_received(std::slice::from_ref(byte));
    }
    assert_eq!(pair.server.handler().messages, vec![ping(42), ping(43)]);

    pair.server.send_message_now(&ping(7)).unwrap();
    pair.server_to_client();
    assert_eq!(pair.client.handler().messages, vec![ping(7)]);
}

#[test]
fn test_hello_split_across_reads() {
    let mut pair = Pair::open(SECURE, ConnectionOptions::default());
    let hello = pair.transport.take_bytes(pair.client.handle());
    let (head, tail) = hello.split_at(hello.len() / 2);
    assert_eq!(
        pair.server.on_bytes_received(&head[..1]),
        HandshakeState::ServerWaitingForClientHello
    );
    pair.server.on_bytes_received(&head[1..]);
    assert_eq!(pair.server.on_bytes_received(tail), HandshakeState::Encrypted);
    assert_eq!(pair.server_to_client(), HandshakeState::Encrypted);
}

#[test]
fn test_reply_coalesced_with_first_message() {
    let mut pair = Pair::open(SECURE, ConnectionOptions::default());
    pair.client_to_server();
    pair.server.send_message_now(&ping(5)).unwrap();

    // reply and first encrypted message arrive in one read
    assert_eq!(pair.server_to_client(), HandshakeState::Encrypted);
    assert_eq!(pair.client.handler().messages, vec![ping(5)]);
}

#[test]
fn test_unknown_protocol_rejected_both_sides() {
    let registry = registry();
    let transport = Arc::new(MemoryTransport::new());
    let scheduler = SendScheduler::new(&SchedulerConfig::default());
    let mut server = Connection::accept(
        registry,
        ConnectionHandle::next(),
        &scheduler,
        transport.clone(),
        Recorder::default(),
        ConnectionOptions::default(),
    );

    // hello for protocol 9 with an empty DH value
    assert_eq!(server.on_bytes_received(&[9, 0, 0]), HandshakeState::Closed);
    assert_eq!(server.handler().errors.len(), 1);
    assert!(server.handler().errors[0].contains("UnknownProtocol(9)"));
    assert_eq!(
        &transport.take_bytes(server.handle())[..],
        &[0x02, 1, 0, 0, 0]
    );
    assert_eq!(transport.disconnected(server.handle()), Some(true));

    // further bytes are ignored and nothing is reported twice
    server.on_bytes_received(&[1, 2, 3]);
    server.expire_handshake();
    assert_eq!(server.handler().errors.len(), 1);
}

#[test]
fn test_client_reports_rejection_code() {
    let mut pair = Pair::open(
        PLAIN,
        ConnectionOptions {
            require_encryption: true,
            ..ConnectionOptions::default()
        },
    );
    assert_eq!(pair.client_to_server(), HandshakeState::Closed);
    assert!(pair.server.handler().errors[0].contains("EncryptionRequired"));

    assert_eq!(pair.server_to_client(), HandshakeState::Closed);
    assert_eq!(pair.client.handler().errors.len(), 1);
    assert!(pair.client.handler().errors[0].contains("PeerRejected(5)"));
    assert_eq!(pair.client.handler().established, 0);
}

#[test]
fn test_malformed_count_closes_without_dispatch() {
    let mut pair = Pair::open(PLAIN, ConnectionOptions::default());
    pair.handshake();

    // Blob with count 17, declared max 16
    let state = pair
        .server
        .on_bytes_received(&[2, 0, 17, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(state, HandshakeState::Closed);
    assert!(pair.server.handler().messages.is_empty());
    assert!(pair.server.handler().errors[0].starts_with("Framing"));
}

#[test]
fn test_unknown_message_id_closes() {
    let mut pair = Pair::open(PLAIN, ConnectionOptions::default());
    pair.handshake();
    pair.server.on_bytes_received(&[1, 0, 1, 0, 0, 0, 0x30, 0x00]);
    assert_eq!(pair.server.state(), HandshakeState::Closed);
    assert_eq!(pair.server.handler().messages, vec![ping(1)]);
    assert!(pair.server.handler().errors[0].contains("UnknownMessageId(48)"));
}

#[test]
fn test_handler_rejection_is_fatal() {
    let mut pair = Pair::open(PLAIN, ConnectionOptions::default());
    pair.handshake();
    pair.server.handler_mut().reject_messages = true;
    pair.server.on_bytes_received(&[1, 0, 1, 0, 0, 0]);
    assert_eq!(pair.server.state(), HandshakeState::Closed);
    assert!(pair.server.handler().errors[0].contains("DispatchFailed(1)"));
}

#[test]
fn test_send_state_errors() {
    let mut pair = Pair::open(PLAIN, ConnectionOptions::default());
    assert!(matches!(
        pair.client.send_message(&ping(1)),
        Err(ProtocolError::NotEstablished)
    ));
    pair.handshake();

    assert!(matches!(
        pair.client.send_message(&Message::builder(99).build()),
        Err(ProtocolError::UnknownSendMessage(99))
    ));
    assert!(matches!(
        pair.client.send_message(&Message::builder(1).uint(1 << 40).build()),
        Err(ProtocolError::InvalidValue(_))
    ));
    assert!(pair.client.is_established());

    pair.client.disconnect(false);
    assert!(matches!(
        pair.client.send_message(&ping(1)),
        Err(ProtocolError::ConnectionClosed)
    ));
}

#[test]
fn test_graceful_disconnect_flushes() {
    let mut pair = Pair::open(PLAIN, ConnectionOptions::default());
    pair.handshake();
    pair.client.send_message(&ping(1)).unwrap();
    assert_eq!(pair.client.pending_send_len(), 6);

    pair.client.disconnect(false);
    assert_eq!(pair.transport.take_bytes(pair.client.handle()).len(), 6);
    assert_eq!(pair.transport.disconnected(pair.client.handle()), Some(false));
    assert!(pair.client.handler().errors.is_empty());
}

#[test]
fn test_hard_disconnect_discards() {
    let mut pair = Pair::open(PLAIN, ConnectionOptions::default());
    pair.handshake();
    pair.client.send_message(&ping(1)).unwrap();

    pair.client.disconnect(true);
    assert!(pair.transport.take_bytes(pair.client.handle()).is_empty());
    assert_eq!(pair.transport.disconnected(pair.client.handle()), Some(true));
}

#[test]
fn test_handshake_timeout() {
    let mut pair = Pair::open(
        SECURE,
        ConnectionOptions {
            handshake_timeout: Duration::ZERO,
            ..ConnectionOptions::default()
        },
    );
    assert!(pair.server.check_handshake_timeout());
    assert_eq!(pair.server.state(), HandshakeState::Closed);
    assert!(pair.server.handler().errors[0].contains("Timeout"));
    assert!(!pair.server.check_handshake_timeout());
    assert_eq!(pair.server.handler().errors.len(), 1);
}

#[test]
fn test_peer_disconnect() {
    let mut pair = Pair::open(PLAIN, ConnectionOptions::default());
    pair.server.on_disconnected();
    assert!(pair.server.handler().errors[0].contains("ConnectionClosed"));

    let mut pair = Pair::open(PLAIN, ConnectionOptions::default());
    pair.handshake();
    pair.server.on_disconnected();
    assert!(pair.server.handler().disconnected);
    assert!(pair.server.handler().errors.is_empty());
}

#[test]
fn test_failed_timer_flush_closes_connection() {
    let mut pair = Pair::open(PLAIN, ConnectionOptions::default());
    pair.handshake();
    pair.client.send_message(&ping(1)).unwrap();

    pair.transport.disconnect(pair.client.handle(), true);
    assert_eq!(pair.scheduler.flush_all(), 0);

    assert!(matches!(
        pair.client.send_message(&ping(2)),
        Err(ProtocolError::ConnectionClosed)
    ));
    assert_eq!(pair.client.state(), HandshakeState::Closed);
    assert_eq!(pair.client.handler().errors.len(), 1);
    assert!(pair.client.handler().errors[0].starts_with("Transport"));

    assert!(matches!(
        pair.client.send_message(&ping(3)),
        Err(ProtocolError::ConnectionClosed)
    ));
    assert_eq!(pair.client.handler().errors.len(), 1);
}

#[test]
fn test_failed_flush_surfaces_on_receive() {
    let mut pair = Pair::open(PLAIN, ConnectionOptions::default());
    pair.handshake();
    pair.server.send_message(&ping(1)).unwrap();
    pair.transport.disconnect(pair.server.handle(), true);
    pair.scheduler.flush_all();

    let state = pair.server.on_bytes_received(&[1, 0, 9, 0, 0, 0]);
    assert_eq!(state, HandshakeState::Closed);
    assert!(pair.server.handler().messages.is_empty());
    assert!(pair.server.handler().errors[0].starts_with("Transport"));
}

#[test]
fn test_explicit_flush_failure_closes() {
    let mut pair = Pair::open(PLAIN, ConnectionOptions::default());
    pair.handshake();
    pair.client.send_message(&ping(1)).unwrap();
    pair.transport.disconnect(pair.client.handle(), true);

    assert!(matches!(pair.client.flush(), Err(ProtocolError::ConnectionClosed)));
    assert_eq!(pair.client.state(), HandshakeState::Closed);
    assert_eq!(pair.client.handler().errors.len(), 1);
    assert!(!pair.client.check_send_failure());
}

#[test]
fn test_small_receive_limit_still_establishes() {
    // Blob needs 22 bytes at most; frames that fit are still delivered
    let mut pair = Pair::open(
        PLAIN,
        ConnectionOptions {
            max_pending_bytes: 8,
            ..ConnectionOptions::default()
        },
    );
    pair.handshake();
    pair.client.send_message_now(&ping(4)).unwrap();
    pair.client_to_server();
    assert_eq!(pair.server.handler().messages, vec![ping(4)]);
}
