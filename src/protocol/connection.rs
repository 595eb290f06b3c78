//! Per-socket protocol state.
//!
//! A [`Connection`] ties together the channel it speaks, its cipher state, its receive
//! accumulator and its send queue, and drives the handshake state machine:
//!
//! ```text
//! server: ServerWaitingForClientHello --hello ok--> Encrypted
//! client: ClientSentHello --sent--> AwaitingPeerDhValue --reply ok--> Encrypted
//! any:    --fatal error / disconnect--> Closed
//! ```
//!
//! The owner must call [`Connection::on_bytes_received`] and
//! [`Connection::on_disconnected`] serially; a connection is never shared between
//! concurrent callbacks, so it carries no locks of its own. Connection-fatal errors are
//! reported exactly once through [`ConnectionHandler::on_error`].

use crate::config::NetworkConfig;
use crate::core::codec;
use crate::core::message::{Message, NetMessage};
use crate::error::{HandshakeFailure, ProtocolError, Result};
use crate::protocol::accumulator::ReceiveAccumulator;
use crate::protocol::crypto::Encryptor;
use crate::protocol::handshake::{self, ClientHandshake, ClientHello, ServerReply};
use crate::protocol::registry::{Channel, ChannelRegistry};
use crate::protocol::scheduler::{SendQueue, SendScheduler};
use crate::transport::{ConnectionHandle, Transport};
use crate::utils::metrics::global_metrics;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Handshake progress of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    ServerWaitingForClientHello,
    ClientSentHello,
    AwaitingPeerDhValue,
    Encrypted,
    Closed,
}

impl HandshakeState {
    pub fn is_handshaking(&self) -> bool {
        matches!(
            self,
            HandshakeState::ServerWaitingForClientHello
                | HandshakeState::ClientSentHello
                | HandshakeState::AwaitingPeerDhValue
        )
    }
}

/// Callbacks from a connection to the protocol layer above it.
///
/// All methods run inside the transport callback that serviced the connection and must not
/// block.
pub trait ConnectionHandler: Send {
    /// Session established; messages may now be sent
    fn on_handshake_complete(&mut self, _handle: ConnectionHandle) {}

    /// A complete message arrived. Returning an error closes the connection.
    fn on_message(&mut self, handle: ConnectionHandle, message: Message) -> Result<()>;

    /// The connection failed and is now closed. Called at most once.
    fn on_error(&mut self, _handle: ConnectionHandle, _error: &ProtocolError) {}

    /// The peer went away after the session was established
    fn on_disconnected(&mut self, _handle: ConnectionHandle) {}
}

/// Settings a connection takes from [`NetworkConfig`]
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub max_pending_bytes: usize,
    pub handshake_timeout: Duration,
    pub require_encryption: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for ConnectionOptions {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            max_pending_bytes: config.limits.max_pending_bytes,
            handshake_timeout: config.handshake.timeout,
            require_encryption: config.handshake.require_encryption,
        }
    }
}

/// One end of a message session
pub struct Connection<H: ConnectionHandler> {
    handle: ConnectionHandle,
    registry: Arc<ChannelRegistry>,
    channel: Option<Arc<Channel>>,
    state: HandshakeState,
    encryptor: Encryptor,
    accumulator: Option<ReceiveAccumulator>,
    handshake_buf: BytesMut,
    client: Option<ClientHandshake>,
    queue: SendQueue,
    handler: H,
    options: ConnectionOptions,
    created: Instant,
}

impl<H: ConnectionHandler> Connection<H> {
    /// Server side of a freshly accepted transport connection
    pub fn accept(
        registry: Arc<ChannelRegistry>,
        handle: ConnectionHandle,
        scheduler: &Arc<SendScheduler>,
        transport: Arc<dyn Transport>,
        handler: H,
        options: ConnectionOptions,
    ) -> Self {
        global_metrics().connection_opened();
        global_metrics().handshake_attempt();
        debug!(%handle, "accepted connection");
        Self {
            handle,
            registry,
            channel: None,
            state: HandshakeState::ServerWaitingForClientHello,
            encryptor: Encryptor::plaintext(),
            accumulator: None,
            handshake_buf: BytesMut::new(),
            client: None,
            queue: scheduler.register(handle, transport),
            handler,
            options,
            created: Instant::now(),
        }
    }

    /// Client side: look up the channel, send the hello and await the server's value.
    ///
    /// # Errors
    /// `UnknownProtocol` when no client-side channel is registered for `protocol_id`,
    /// `EncryptionRequired` when encryption is mandatory and the channel has no DH
    /// parameters, or the transport's error if the hello cannot be written.
    #[instrument(skip(registry, scheduler, transport, handler, options))]
    pub fn connect(
        registry: Arc<ChannelRegistry>,
        protocol_id: u8,
        handle: ConnectionHandle,
        scheduler: &Arc<SendScheduler>,
        transport: Arc<dyn Transport>,
        handler: H,
        options: ConnectionOptions,
    ) -> Result<Self> {
        let channel = registry
            .lookup(protocol_id, false)
            .ok_or(HandshakeFailure::UnknownProtocol(protocol_id))?;
        if options.require_encryption && channel.dh().is_none() {
            return Err(HandshakeFailure::EncryptionRequired.into());
        }

        global_metrics().connection_opened();
        global_metrics().handshake_attempt();

        let (client, hello) = handshake::client_start(Arc::clone(&channel));
        let mut conn = Self {
            handle,
            registry,
            channel: Some(channel),
            state: HandshakeState::ClientSentHello,
            encryptor: Encryptor::plaintext(),
            accumulator: None,
            handshake_buf: BytesMut::new(),
            client: Some(client),
            queue: scheduler.register(handle, transport),
            handler,
            options,
            created: Instant::now(),
        };

        conn.queue.send_now(&hello.encode())?;
        conn.state = HandshakeState::AwaitingPeerDhValue;
        Ok(conn)
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Encrypted
    }

    /// Channel in use; `None` on a server before the hello arrived
    pub fn channel(&self) -> Option<&Arc<Channel>> {
        self.channel.as_ref()
    }

    pub fn encryptor(&self) -> &Encryptor {
        &self.encryptor
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Time since the connection was created
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Bytes waiting in this connection's send buffer
    pub fn pending_send_len(&self) -> usize {
        self.queue.pending_len()
    }

    /// Feed bytes read from the transport. Returns the state afterwards.
    pub fn on_bytes_received(&mut self, bytes: &[u8]) -> HandshakeState {
        global_metrics().bytes_received(bytes.len());
        if self.check_send_failure() {
            return self.state;
        }
        let result = match self.state {
            HandshakeState::Closed => return HandshakeState::Closed,
            HandshakeState::ServerWaitingForClientHello => self.receive_hello(bytes),
            HandshakeState::AwaitingPeerDhValue => self.receive_reply(bytes),
            HandshakeState::Encrypted => self.receive_encrypted(bytes),
            HandshakeState::ClientSentHello => Err(HandshakeFailure::UnexpectedPacket.into()),
        };
        if let Err(e) = result {
            self.fail(e);
        }
        self.state
    }

    fn receive_hello(&mut self, bytes: &[u8]) -> Result<()> {
        self.handshake_buf.extend_from_slice(bytes);
        let parsed = ClientHello::parse(&self.handshake_buf);
        let (hello, used) = match parsed {
            Ok(Some(found)) => found,
            Ok(None) => return Ok(()),
            Err(e) => return Err(self.reject(e)),
        };
        let rest = self.handshake_buf.split_off(used);
        self.handshake_buf.clear();

        let accept = match handshake::server_accept_hello(&self.registry, &hello) {
            Ok(accept) => accept,
            Err(e) => return Err(self.reject(e)),
        };
        if self.options.require_encryption && !accept.encryptor.is_encrypted() {
            return Err(self.reject(HandshakeFailure::EncryptionRequired.into()));
        }

        self.queue.send_now(&accept.reply.encode())?;
        self.establish(accept.channel, accept.encryptor);
        self.continue_with(&rest)
    }

    fn receive_reply(&mut self, bytes: &[u8]) -> Result<()> {
        self.handshake_buf.extend_from_slice(bytes);
        let Some((reply, used)) = ServerReply::parse(&self.handshake_buf)? else {
            return Ok(());
        };
        let rest = self.handshake_buf.split_off(used);
        self.handshake_buf.clear();

        let client = self
            .client
            .take()
            .ok_or(HandshakeFailure::UnexpectedPacket)?;
        let channel = Arc::clone(client.channel());
        let encryptor = handshake::client_finish(client, &reply)?;
        self.establish(channel, encryptor);
        self.continue_with(&rest)
    }

    /// Bytes that arrived in the same read as the last handshake packet
    fn continue_with(&mut self, rest: &[u8]) -> Result<()> {
        if rest.is_empty() || self.state != HandshakeState::Encrypted {
            return Ok(());
        }
        self.receive_encrypted(rest)
    }

    /// Send the server error reply for `error` and pass it through
    fn reject(&mut self, error: ProtocolError) -> ProtocolError {
        if let ProtocolError::Handshake(reason) = &error {
            let reply = ServerReply::Error(reason.code()).encode();
            if let Err(e) = self.queue.send_now(&reply) {
                debug!(handle = %self.handle, error = %e, "could not send handshake rejection");
            }
        }
        error
    }

    fn establish(&mut self, channel: Arc<Channel>, encryptor: Encryptor) {
        info!(
            handle = %self.handle,
            protocol_id = channel.protocol_id(),
            encrypted = encryptor.is_encrypted(),
            "session established"
        );
        let accumulator =
            ReceiveAccumulator::new(Arc::clone(&channel), self.options.max_pending_bytes);
        if !accumulator.fits_largest_message() {
            warn!(
                handle = %self.handle,
                limit = self.options.max_pending_bytes,
                largest = channel.largest_recv_size(),
                "receive limit is below the largest message of this channel"
            );
        }
        self.accumulator = Some(accumulator);
        self.channel = Some(channel);
        self.encryptor = encryptor;
        self.state = HandshakeState::Encrypted;
        global_metrics().handshake_success();
        self.handler.on_handshake_complete(self.handle);
    }

    fn receive_encrypted(&mut self, bytes: &[u8]) -> Result<()> {
        let mut plain = BytesMut::from(bytes);
        self.encryptor.decrypt(&mut plain)?;

        let Self {
            accumulator,
            handler,
            handle,
            ..
        } = self;
        let accumulator = accumulator.as_mut().ok_or(ProtocolError::NotEstablished)?;
        let handle = *handle;

        accumulator.push(&plain, |message| {
            let id = message.id;
            global_metrics().message_received();
            handler.on_message(handle, message).map_err(|e| {
                warn!(%handle, msg_id = id, error = %e, "dispatch failed");
                ProtocolError::DispatchFailed(id)
            })
        })?;
        Ok(())
    }

    /// Encode, encrypt and queue a message for the timer flush.
    ///
    /// # Errors
    /// `NotEstablished` before the handshake completes, `ConnectionClosed` after close,
    /// `UnknownSendMessage` for ids missing from the channel's send table, and
    /// `InvalidValue` when the message does not fit its schema. None of these close the
    /// connection.
    pub fn send_message(&mut self, message: &Message) -> Result<()> {
        self.check_send_failure();
        match self.state {
            HandshakeState::Encrypted => {}
            HandshakeState::Closed => return Err(ProtocolError::ConnectionClosed),
            _ => return Err(ProtocolError::NotEstablished),
        }
        let channel = self.channel.as_ref().ok_or(ProtocolError::NotEstablished)?;
        let schema = channel
            .send_schema(message.id)
            .ok_or(ProtocolError::UnknownSendMessage(message.id))?;
        let bytes = codec::encode(schema, message)?;

        match self.queue.enqueue(&mut self.encryptor, &bytes) {
            Ok(()) => {
                global_metrics().message_sent();
                Ok(())
            }
            Err(e) => {
                self.fail(e);
                Err(ProtocolError::ConnectionClosed)
            }
        }
    }

    /// Send a message and flush immediately
    pub fn send_message_now(&mut self, message: &Message) -> Result<()> {
        self.send_message(message)?;
        self.flush()
    }

    /// Send a typed message
    pub fn send<M: NetMessage>(&mut self, message: &M) -> Result<()> {
        self.send_message(&message.to_message())
    }

    /// Write pending bytes without waiting for the flush timer
    pub fn flush(&mut self) -> Result<()> {
        if self.state == HandshakeState::Closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.queue.flush_now().map_err(|e| {
            self.fail(e);
            ProtocolError::ConnectionClosed
        })
    }

    /// Close the connection if an earlier transport write failed, e.g. one issued by the
    /// flush timer. Returns true when that happened.
    pub fn check_send_failure(&mut self) -> bool {
        if self.state == HandshakeState::Closed {
            return false;
        }
        match self.queue.failure() {
            Some(e) => {
                self.fail(e);
                true
            }
            None => false,
        }
    }

    /// Close the connection. A graceful close flushes pending sends first; a hard close
    /// discards them.
    pub fn disconnect(&mut self, hard: bool) {
        if self.state == HandshakeState::Closed {
            return;
        }
        if hard {
            let dropped = self.queue.discard();
            debug!(handle = %self.handle, dropped, "hard disconnect");
        } else if let Err(e) = self.queue.flush_now() {
            warn!(handle = %self.handle, error = %e, "flush before disconnect failed");
        }
        self.close(hard);
    }

    /// The transport reports the peer is gone
    pub fn on_disconnected(&mut self) {
        match self.state {
            HandshakeState::Closed => {}
            state if state.is_handshaking() => self.fail(ProtocolError::ConnectionClosed),
            _ => {
                self.queue.discard();
                self.close(true);
                self.handler.on_disconnected(self.handle);
            }
        }
    }

    /// Abandon the handshake if it has been running longer than the configured timeout.
    /// Returns `true` if the connection was closed.
    pub fn check_handshake_timeout(&mut self) -> bool {
        if self.state.is_handshaking() && self.age() >= self.options.handshake_timeout {
            self.expire_handshake();
            return true;
        }
        false
    }

    /// Abandon an unfinished handshake now
    pub fn expire_handshake(&mut self) {
        if self.state.is_handshaking() {
            self.fail(HandshakeFailure::Timeout.into());
        }
    }

    fn fail(&mut self, error: ProtocolError) {
        if self.state == HandshakeState::Closed {
            return;
        }
        let metrics = global_metrics();
        if self.state.is_handshaking() {
            metrics.handshake_failed();
        }
        match error {
            ProtocolError::Framing(_)
            | ProtocolError::UnknownMessageId(_)
            | ProtocolError::ResourceExhausted { .. } => metrics.framing_error(),
            _ => metrics.protocol_error(),
        }
        warn!(handle = %self.handle, state = ?self.state, error = %error, "closing connection");

        self.queue.discard();
        if let Some(acc) = self.accumulator.as_mut() {
            acc.clear();
        }
        self.close(true);
        self.handler.on_error(self.handle, &error);
    }

    fn close(&mut self, hard: bool) {
        self.state = HandshakeState::Closed;
        self.handshake_buf.clear();
        self.client = None;
        self.queue.transport().disconnect(self.handle, hard);
        global_metrics().connection_closed();
    }
}

impl<H: ConnectionHandler> Drop for Connection<H> {
    fn drop(&mut self) {
        if self.state != HandshakeState::Closed {
            global_metrics().connection_closed();
        }
    }
}

impl<H: ConnectionHandler> std::fmt::Debug for Connection<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .field("protocol_id", &self.channel.as_ref().map(|c| c.protocol_id()))
            .field("encryptor", &self.encryptor)
            .finish_non_exhaustive()
    }
}
