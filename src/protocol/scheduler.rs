//! Outbound batching.
//!
//! Every connection owns a [`SendQueue`]: a buffer of already-encrypted bytes waiting to
//! be written. A shared [`SendScheduler`] tracks all queues and, on each tick of its flush
//! timer, hands every non-empty buffer to the transport in one write.
//!
//! Bytes are encrypted while the queue's buffer lock is held and the transport write
//! happens under the same lock, so neither the timer nor an explicit flush can reorder
//! one connection's output.
//!
//! A failed transport write poisons the queue: the failure is kept and every later
//! enqueue or flush returns it, so the owning connection learns about bytes that never
//! left, whether the write was issued by the timer or by the connection itself.

use crate::config::SchedulerConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::crypto::Encryptor;
use crate::transport::{ConnectionHandle, Transport};
use crate::utils::metrics::global_metrics;
use bytes::BytesMut;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

struct SendSlot {
    handle: ConnectionHandle,
    transport: Arc<dyn Transport>,
    buffer: Mutex<BytesMut>,
    failure: OnceCell<String>,
}

impl SendSlot {
    fn lock(&self) -> MutexGuard<'_, BytesMut> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The recorded write failure, if any
    fn check(&self) -> Result<()> {
        match self.failure.get() {
            Some(reason) => Err(send_failed(reason)),
            None => Ok(()),
        }
    }

    fn flush_locked(&self, buffer: &mut BytesMut) -> Result<()> {
        self.check()?;
        if buffer.is_empty() {
            return Ok(());
        }
        let bytes = buffer.split().freeze();
        let len = bytes.len();
        if let Err(e) = self.transport.send(self.handle, bytes) {
            warn!(handle = %self.handle, lost = len, error = %e, "transport write failed");
            let reason = self.failure.get_or_init(|| e.to_string());
            return Err(send_failed(reason));
        }
        global_metrics().flushed(len);
        trace!(handle = %self.handle, len, "flushed send buffer");
        Ok(())
    }
}

fn send_failed(reason: &str) -> ProtocolError {
    ProtocolError::Transport(format!("{}: {reason}", constants::ERR_SEND_FAILED))
}

/// Shared registry of send queues plus the flush timer that drains them
pub struct SendScheduler {
    send_buffer_size: usize,
    flush_interval: Duration,
    slots: Mutex<HashMap<ConnectionHandle, Arc<SendSlot>>>,
}

impl SendScheduler {
    pub fn new(config: &SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            send_buffer_size: config.send_buffer_size.max(1),
            flush_interval: config.flush_interval,
            slots: Mutex::new(HashMap::new()),
        })
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<ConnectionHandle, Arc<SendSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the queue for a new connection. Dropping the queue unregisters it.
    pub fn register(
        self: &Arc<Self>,
        handle: ConnectionHandle,
        transport: Arc<dyn Transport>,
    ) -> SendQueue {
        let slot = Arc::new(SendSlot {
            handle,
            transport,
            buffer: Mutex::new(BytesMut::with_capacity(self.send_buffer_size)),
            failure: OnceCell::new(),
        });
        self.slots().insert(handle, Arc::clone(&slot));
        debug!(%handle, "send queue registered");
        SendQueue {
            slot,
            scheduler: Arc::downgrade(self),
            send_buffer_size: self.send_buffer_size,
        }
    }

    fn unregister(&self, handle: ConnectionHandle) {
        if self.slots().remove(&handle).is_some() {
            debug!(%handle, "send queue unregistered");
        }
    }

    /// Number of registered queues
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Write out every non-empty queue. Returns the number of queues flushed.
    ///
    /// The queue list is snapshotted first so registration on other threads is never
    /// blocked behind transport writes. A failed write is recorded on its queue and
    /// surfaces through that queue's next operation.
    pub fn flush_all(&self) -> usize {
        let snapshot: Vec<Arc<SendSlot>> = self.slots().values().cloned().collect();
        let mut flushed = 0;
        for slot in snapshot {
            let mut buffer = slot.lock();
            if buffer.is_empty() {
                continue;
            }
            if slot.flush_locked(&mut buffer).is_ok() {
                flushed += 1;
            }
        }
        flushed
    }

    /// Spawn the periodic flush task on the current tokio runtime.
    ///
    /// The task stops when `cancel` fires or the scheduler is dropped.
    pub fn spawn_flush_timer(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let scheduler: Weak<Self> = Arc::downgrade(self);
        let period = self.flush_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(scheduler) = scheduler.upgrade() else { break };
                        scheduler.flush_all();
                    }
                }
            }
            debug!("flush timer stopped");
        })
    }
}

/// One connection's pending outbound bytes
pub struct SendQueue {
    slot: Arc<SendSlot>,
    scheduler: Weak<SendScheduler>,
    send_buffer_size: usize,
}

impl SendQueue {
    pub fn handle(&self) -> ConnectionHandle {
        self.slot.handle
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.slot.transport
    }

    /// Encrypt `bytes` and append them. Writes to the transport only when the buffer
    /// reaches the configured send buffer size.
    pub fn enqueue(&self, encryptor: &mut Encryptor, bytes: &[u8]) -> Result<()> {
        let mut buffer = self.slot.lock();
        self.slot.check()?;
        if !buffer.is_empty() && buffer.len() + bytes.len() > self.send_buffer_size {
            self.slot.flush_locked(&mut buffer)?;
        }

        let start = buffer.len();
        buffer.extend_from_slice(bytes);
        if let Err(e) = encryptor.encrypt(&mut buffer[start..]) {
            buffer.truncate(start);
            return Err(e);
        }

        if buffer.len() >= self.send_buffer_size {
            self.slot.flush_locked(&mut buffer)?;
        }
        Ok(())
    }

    /// Append `bytes` unmodified and write everything pending right away.
    ///
    /// Used for handshake packets, which must not wait for the timer.
    pub fn send_now(&self, bytes: &[u8]) -> Result<()> {
        let mut buffer = self.slot.lock();
        self.slot.check()?;
        buffer.extend_from_slice(bytes);
        self.slot.flush_locked(&mut buffer)
    }

    /// Write everything pending without waiting for the timer
    pub fn flush_now(&self) -> Result<()> {
        let mut buffer = self.slot.lock();
        self.slot.flush_locked(&mut buffer)
    }

    /// Error from a transport write that already failed on this queue
    pub fn failure(&self) -> Option<ProtocolError> {
        self.slot.check().err()
    }

    /// Drop everything pending
    pub fn discard(&self) -> usize {
        let mut buffer = self.slot.lock();
        let dropped = buffer.len();
        buffer.clear();
        dropped
    }

    pub fn pending_len(&self) -> usize {
        self.slot.lock().len()
    }
}

impl Drop for SendQueue {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.unregister(self.slot.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crypto::{Role, SessionKeys};
    use crate::transport::memory::MemoryTransport;
    use num_bigint::BigUint;

    fn scheduler(buffer: usize) -> Arc<SendScheduler> {
        SendScheduler::new(&SchedulerConfig {
            flush_interval: Duration::from_millis(5),
            send_buffer_size: buffer,
        })
    }

    #[test]
    fn test_enqueue_waits_for_flush() {
        let transport = Arc::new(MemoryTransport::new());
        let sched = scheduler(1460);
        let handle = ConnectionHandle::next();
        let queue = sched.register(handle, transport.clone());
        let mut enc = Encryptor::plaintext();

        queue.enqueue(&mut enc, &[1, 2, 3]).unwrap();
        queue.enqueue(&mut enc, &[4]).unwrap();
        assert_eq!(transport.write_count(handle), 0);
        assert_eq!(queue.pending_len(), 4);

        assert_eq!(sched.flush_all(), 1);
        assert_eq!(transport.write_count(handle), 1);
        assert_eq!(&transport.take_bytes(handle)[..], &[1, 2, 3, 4]);
        assert_eq!(sched.flush_all(), 0);
    }

    #[test]
    fn test_full_buffer_flushes_in_order() {
        let transport = Arc::new(MemoryTransport::new());
        let sched = scheduler(8);
        let handle = ConnectionHandle::next();
        let queue = sched.register(handle, transport.clone());
        let mut enc = Encryptor::plaintext();

        queue.enqueue(&mut enc, &[1; 5]).unwrap();
        queue.enqueue(&mut enc, &[2; 5]).unwrap();
        assert_eq!(transport.write_count(handle), 1);
        queue.enqueue(&mut enc, &[3; 3]).unwrap();
        assert_eq!(transport.write_count(handle), 2);

        let bytes = transport.take_bytes(handle);
        assert_eq!(&bytes[..], &[1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 3, 3, 3]);
    }

    #[test]
    fn test_encrypts_in_enqueue_order() {
        let transport = Arc::new(MemoryTransport::new());
        let sched = scheduler(1460);
        let handle = ConnectionHandle::next();
        let queue = sched.register(handle, transport.clone());

        let shared = BigUint::from(99u32);
        let mut out = Encryptor::from_keys(&SessionKeys::derive(&shared, Role::Client));
        let mut peer = Encryptor::from_keys(&SessionKeys::derive(&shared, Role::Server));

        queue.enqueue(&mut out, b"abc").unwrap();
        queue.flush_now().unwrap();
        queue.enqueue(&mut out, b"def").unwrap();
        sched.flush_all();

        let mut wire = transport.take_bytes(handle).to_vec();
        assert_ne!(&wire[..], b"abcdef");
        peer.decrypt(&mut wire).unwrap();
        assert_eq!(&wire[..], b"abcdef");
    }

    #[test]
    fn test_failed_timer_flush_is_reported_to_queue() {
        let transport = Arc::new(MemoryTransport::new());
        let sched = scheduler(1460);
        let handle = ConnectionHandle::next();
        let queue = sched.register(handle, transport.clone());
        let mut enc = Encryptor::plaintext();

        queue.enqueue(&mut enc, &[1, 2]).unwrap();
        transport.disconnect(handle, true);
        assert_eq!(sched.flush_all(), 0);
        assert!(matches!(queue.failure(), Some(ProtocolError::Transport(_))));

        assert!(matches!(queue.enqueue(&mut enc, &[3]), Err(ProtocolError::Transport(_))));
        assert!(matches!(queue.flush_now(), Err(ProtocolError::Transport(_))));
        assert!(matches!(queue.send_now(&[4]), Err(ProtocolError::Transport(_))));
        assert_eq!(transport.write_count(handle), 0);
        // failed queues are skipped by later timer passes
        assert_eq!(sched.flush_all(), 0);
    }

    #[test]
    fn test_drop_unregisters() {
        let transport = Arc::new(MemoryTransport::new());
        let sched = scheduler(1460);
        let queue = sched.register(ConnectionHandle::next(), transport);
        assert_eq!(sched.len(), 1);
        drop(queue);
        assert!(sched.is_empty());
    }

    #[tokio::test]
    async fn test_timer_flushes() {
        let transport = Arc::new(MemoryTransport::new());
        let sched = scheduler(1460);
        let handle = ConnectionHandle::next();
        let queue = sched.register(handle, transport.clone());
        let cancel = CancellationToken::new();
        let timer = sched.spawn_flush_timer(cancel.clone());

        queue.enqueue(&mut Encryptor::plaintext(), &[7, 7]).unwrap();
        for _ in 0..100 {
            if transport.write_count(handle) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(&transport.take_bytes(handle)[..], &[7, 7]);

        cancel.cancel();
        timer.await.unwrap();
    }
}
