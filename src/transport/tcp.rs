//! Tokio TCP transport.
//!
//! [`TcpEndpoint`] owns one driver task per socket. The driver is the only code that
//! touches that socket's [`Connection`], so reads, API commands and the handshake deadline
//! are serialized through one `select!` loop. Writes go through a per-socket writer task
//! fed by an unbounded channel, which keeps [`Transport::send`] non-blocking.

use crate::config::NetworkConfig;
use crate::core::message::Message;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::connection::{Connection, ConnectionHandler, ConnectionOptions};
use crate::protocol::registry::ChannelRegistry;
use crate::protocol::scheduler::SendScheduler;
use crate::transport::{ConnectionHandle, Transport};
use crate::utils::metrics::global_metrics;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{BytesCodec, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

enum WriterCommand {
    Data(Bytes),
    Close { hard: bool },
}

enum DriverCommand {
    Send {
        message: Message,
        flush: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        hard: bool,
    },
}

/// [`Transport`] over tokio TCP write halves
#[derive(Default)]
pub struct TcpTransport {
    writers: Mutex<HashMap<ConnectionHandle, mpsc::UnboundedSender<WriterCommand>>>,
}

impl TcpTransport {
    fn writers(&self) -> MutexGuard<'_, HashMap<ConnectionHandle, mpsc::UnboundedSender<WriterCommand>>> {
        self.writers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach(&self, handle: ConnectionHandle, mut half: OwnedWriteHalf) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.writers().insert(handle, tx);

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    WriterCommand::Data(bytes) => {
                        if let Err(e) = half.write_all(&bytes).await {
                            warn!(%handle, error = %e, "socket write failed");
                            break;
                        }
                    }
                    WriterCommand::Close { hard } => {
                        if !hard {
                            let _ = half.shutdown().await;
                        }
                        break;
                    }
                }
            }
            debug!(%handle, "writer task finished");
        });
    }
}

impl Transport for TcpTransport {
    fn send(&self, handle: ConnectionHandle, bytes: Bytes) -> Result<()> {
        let writers = self.writers();
        let writer = writers
            .get(&handle)
            .ok_or_else(|| ProtocolError::Transport(constants::ERR_CONNECTION_CLOSED.into()))?;
        writer
            .send(WriterCommand::Data(bytes))
            .map_err(|_| ProtocolError::Transport(constants::ERR_CONNECTION_CLOSED.into()))
    }

    fn disconnect(&self, handle: ConnectionHandle, hard: bool) {
        if let Some(writer) = self.writers().remove(&handle) {
            let _ = writer.send(WriterCommand::Close { hard });
        }
    }
}

/// Client and server entry point for message sessions over TCP.
///
/// Must be created inside a tokio runtime; it spawns the shared flush timer.
pub struct TcpEndpoint {
    registry: Arc<ChannelRegistry>,
    options: ConnectionOptions,
    scheduler: Arc<SendScheduler>,
    transport: Arc<TcpTransport>,
    drivers: Mutex<HashMap<ConnectionHandle, mpsc::UnboundedSender<DriverCommand>>>,
    cancel: CancellationToken,
}

impl TcpEndpoint {
    pub fn new(registry: Arc<ChannelRegistry>, config: &NetworkConfig) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let scheduler = SendScheduler::new(&config.scheduler);
        scheduler.spawn_flush_timer(cancel.child_token());

        Arc::new(Self {
            registry,
            options: ConnectionOptions::from(config),
            scheduler,
            transport: Arc::new(TcpTransport::default()),
            drivers: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    fn drivers(&self) -> MutexGuard<'_, HashMap<ConnectionHandle, mpsc::UnboundedSender<DriverCommand>>> {
        self.drivers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.drivers().len()
    }

    /// Open a client session. Handshake completion is reported through `handler`.
    #[instrument(skip(self, addr, handler))]
    pub async fn connect<A, H>(
        self: &Arc<Self>,
        protocol_id: u8,
        addr: A,
        handler: H,
    ) -> Result<ConnectionHandle>
    where
        A: ToSocketAddrs,
        H: ConnectionHandler + 'static,
    {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();

        let handle = ConnectionHandle::next();
        self.transport.attach(handle, write);
        let transport: Arc<dyn Transport> = self.transport.clone();
        let conn = match Connection::connect(
            Arc::clone(&self.registry),
            protocol_id,
            handle,
            &self.scheduler,
            transport,
            handler,
            self.options.clone(),
        ) {
            Ok(conn) => conn,
            Err(e) => {
                self.transport.disconnect(handle, true);
                return Err(e);
            }
        };

        self.spawn_driver(conn, read);
        Ok(handle)
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called
    #[instrument(skip_all)]
    pub async fn serve<H, F>(self: &Arc<Self>, listener: TcpListener, make_handler: F) -> Result<()>
    where
        H: ConnectionHandler + 'static,
        F: Fn(ConnectionHandle) -> H + Send + Sync + 'static,
    {
        info!(address = ?listener.local_addr().ok(), "listening");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("shutting down listener");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "error accepting connection");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let (read, write) = stream.into_split();
                    let handle = ConnectionHandle::next();
                    info!(%peer, %handle, "new connection");

                    self.transport.attach(handle, write);
                    let transport: Arc<dyn Transport> = self.transport.clone();
                    let conn = Connection::accept(
                        Arc::clone(&self.registry),
                        handle,
                        &self.scheduler,
                        transport,
                        make_handler(handle),
                        self.options.clone(),
                    );
                    self.spawn_driver(conn, read);
                }
            }
        }
    }

    /// Queue a message on an established session
    pub async fn send_message(&self, handle: ConnectionHandle, message: Message) -> Result<()> {
        self.command(handle, message, false).await
    }

    /// Send a message and flush it without waiting for the timer
    pub async fn send_message_now(&self, handle: ConnectionHandle, message: Message) -> Result<()> {
        self.command(handle, message, true).await
    }

    async fn command(&self, handle: ConnectionHandle, message: Message, flush: bool) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.drivers()
            .get(&handle)
            .ok_or(ProtocolError::ConnectionClosed)?
            .send(DriverCommand::Send {
                message,
                flush,
                reply,
            })
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        response.await.map_err(|_| ProtocolError::ConnectionClosed)?
    }

    /// Close a session; graceful closes flush pending sends first
    pub fn disconnect(&self, handle: ConnectionHandle, hard: bool) {
        if let Some(driver) = self.drivers().get(&handle) {
            let _ = driver.send(DriverCommand::Disconnect { hard });
        }
    }

    /// Stop the listener, the flush timer and every driver (graceful close)
    pub fn shutdown(&self) {
        self.cancel.cancel();
        global_metrics().log_metrics();
    }

    fn spawn_driver<H>(self: &Arc<Self>, conn: Connection<H>, read: OwnedReadHalf)
    where
        H: ConnectionHandler + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        self.drivers().insert(conn.handle(), tx);
        let endpoint = Arc::clone(self);
        tokio::spawn(async move { endpoint.drive(conn, read, rx).await });
    }

    async fn drive<H: ConnectionHandler>(
        self: Arc<Self>,
        mut conn: Connection<H>,
        read: OwnedReadHalf,
        mut commands: mpsc::UnboundedReceiver<DriverCommand>,
    ) {
        let handle = conn.handle();
        let mut frames = FramedRead::new(read, BytesCodec::new());
        let deadline = tokio::time::sleep(self.options.handshake_timeout);
        tokio::pin!(deadline);

        while conn.is_established() || conn.state().is_handshaking() {
            tokio::select! {
                _ = self.cancel.cancelled() => conn.disconnect(false),
                _ = &mut deadline, if conn.state().is_handshaking() => {
                    warn!(%handle, "handshake timed out");
                    conn.expire_handshake();
                }
                command = commands.recv() => match command {
                    Some(DriverCommand::Send { message, flush, reply }) => {
                        let result = if flush {
                            conn.send_message_now(&message)
                        } else {
                            conn.send_message(&message)
                        };
                        let _ = reply.send(result);
                    }
                    Some(DriverCommand::Disconnect { hard }) => conn.disconnect(hard),
                    None => conn.disconnect(true),
                },
                frame = frames.next() => match frame {
                    Some(Ok(bytes)) => {
                        conn.on_bytes_received(&bytes);
                    }
                    Some(Err(e)) => {
                        debug!(%handle, error = %e, "socket read failed");
                        conn.on_disconnected();
                    }
                    None => conn.on_disconnected(),
                },
            }
            conn.check_send_failure();
        }

        self.drivers().remove(&handle);
        debug!(%handle, "driver finished");
    }
}

impl Drop for TcpEndpoint {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
