//! Incremental message reassembly.
//!
//! Transports deliver bytes in arbitrary chunks. [`ReceiveAccumulator`] buffers them,
//! recovers message boundaries from the channel's receive schemas and hands every complete
//! message to a dispatch callback in stream order.
//!
//! The accumulator works on plaintext; the owning connection decrypts each chunk before
//! pushing it. For plaintext byte streams the same logic is available as a
//! [`tokio_util::codec::Decoder`], so it can sit under a `FramedRead`.

use crate::core::codec::{self, Measure};
use crate::core::message::Message;
use crate::error::{ProtocolError, Result};
use crate::protocol::registry::Channel;
use bytes::BytesMut;
use std::sync::Arc;
use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

/// How much of the current message is still outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Awaiting {
    /// Fewer than two bytes buffered, message id unknown
    HeaderOnly,
    /// Body of a message without variable fields
    FixedBody { remaining: usize },
    /// Body of a message whose size depends on counts still being read
    VariableBody { remaining: usize },
}

/// Per-connection receive state
#[derive(Debug)]
pub struct ReceiveAccumulator {
    channel: Arc<Channel>,
    pending: BytesMut,
    awaiting: Awaiting,
    max_pending: usize,
}

impl ReceiveAccumulator {
    pub fn new(channel: Arc<Channel>, max_pending: usize) -> Self {
        Self {
            channel,
            pending: BytesMut::new(),
            awaiting: Awaiting::HeaderOnly,
            max_pending,
        }
    }

    pub fn awaiting(&self) -> Awaiting {
        self.awaiting
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the largest receivable message of this channel fits under the limit
    pub fn fits_largest_message(&self) -> bool {
        self.channel.largest_recv_size() <= self.max_pending as u64
    }

    /// Drop partially received data
    pub fn clear(&mut self) {
        self.pending.clear();
        self.awaiting = Awaiting::HeaderOnly;
    }

    /// Append a chunk and dispatch every message it completes, in order.
    ///
    /// Returns the number of messages dispatched. Stops at the first error, whether from
    /// framing or from `on_message`; any error leaves the stream unusable.
    pub fn push<F>(&mut self, chunk: &[u8], mut on_message: F) -> Result<usize>
    where
        F: FnMut(Message) -> Result<()>,
    {
        if let Awaiting::FixedBody { remaining } | Awaiting::VariableBody { remaining } =
            &mut self.awaiting
        {
            if chunk.len() < *remaining {
                *remaining -= chunk.len();
                self.pending.extend_from_slice(chunk);
                trace!(remaining = *remaining, "need more data");
                return Ok(0);
            }
        }

        self.pending.extend_from_slice(chunk);
        let mut dispatched = 0;
        while let Some(message) = self.next_message()? {
            on_message(message)?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Extract the next complete message from the buffered bytes, if there is one
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        extract(
            &self.channel,
            self.max_pending,
            &mut self.awaiting,
            &mut self.pending,
        )
    }
}

impl Decoder for ReceiveAccumulator {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        extract(&self.channel, self.max_pending, &mut self.awaiting, src)
    }
}

fn extract(
    channel: &Channel,
    max_pending: usize,
    awaiting: &mut Awaiting,
    buf: &mut BytesMut,
) -> Result<Option<Message>> {
    let Some(id) = codec::peek_id(buf) else {
        *awaiting = Awaiting::HeaderOnly;
        return Ok(None);
    };

    let Some(schema) = channel.recv_schema(id) else {
        warn!(msg_id = id, protocol_id = channel.protocol_id(), "no handler for message");
        return Err(ProtocolError::UnknownMessageId(id));
    };

    let (required, complete) = match codec::measure(schema, buf) {
        Ok(Measure::Complete { len, .. }) => (len, true),
        Ok(Measure::Partial { len, .. }) => (len, false),
        Err(e) => {
            warn!(msg_id = id, error = %e, "bad count");
            return Err(e);
        }
    };

    if required > max_pending {
        warn!(msg_id = id, required, limit = max_pending, "message exceeds receive limit");
        return Err(ProtocolError::ResourceExhausted {
            required,
            limit: max_pending,
        });
    }

    // a partial measure always asks for more than is buffered
    if !complete || buf.len() < required {
        let remaining = required - buf.len();
        *awaiting = if schema.has_variable_fields() {
            Awaiting::VariableBody { remaining }
        } else {
            Awaiting::FixedBody { remaining }
        };
        return Ok(None);
    }

    let frame = buf.split_to(required);
    let message = codec::decode(schema, &frame)?;
    *awaiting = Awaiting::HeaderOnly;
    debug!(msg_id = id, name = schema.name(), len = required, "dispatching message");
    Ok(Some(message))
}
