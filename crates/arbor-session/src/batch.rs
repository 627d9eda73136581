//! Batching -- coalesces queued messages into transport frames.
//!
//! A frame holding one message is that message, unchanged. A frame holding
//! several is a batch container:
//!
//! ```text
//! u32 ID_BATCH | var-u32 count | count x (var-u32 length | bytes)
//! ```
//!
//! Queue order is the order messages reach the transport.

use std::collections::VecDeque;

use arbor_codec::varint;
use arbor_codec::{BitDecoder, BitEncoder};
use arbor_protocol::{Outbound, Priority, ID_BATCH, TAG_BYTES};
use bytes::Bytes;

use crate::{Result, SessionError};

#[derive(Debug)]
pub struct Batcher {
    queue: VecDeque<Bytes>,
    /// Sum of length prefix plus body over the queue.
    entries_len: usize,
    max_frame_bytes: usize,
}

impl Batcher {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            entries_len: 0,
            max_frame_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Size of the frame a flush would produce now.
    pub fn frame_len(&self) -> usize {
        match self.queue.len() {
            0 => 0,
            1 => self.queue.front().map_or(0, Bytes::len),
            n => container_len(n, self.entries_len),
        }
    }

    /// Queues one message and returns the frames that must be written now,
    /// oldest first.
    pub fn push(&mut self, message: Outbound) -> Result<Vec<Bytes>> {
        let mut frames = Vec::new();
        let len = message.bytes.len();

        if len > self.max_frame_bytes {
            frames.extend(self.flush()?);
            tracing::debug!(
                bytes = len,
                max = self.max_frame_bytes,
                "batch: oversized message sent alone"
            );
            frames.push(message.bytes);
            return Ok(frames);
        }

        let entry = entry_len(len);
        if !self.queue.is_empty()
            && container_len(self.queue.len() + 1, self.entries_len + entry) > self.max_frame_bytes
        {
            frames.extend(self.flush()?);
        }
        self.queue.push_back(message.bytes);
        self.entries_len += entry;

        if message.priority == Priority::Urgent {
            frames.extend(self.flush()?);
        }
        Ok(frames)
    }

    /// Empties the queue into one frame. On error the queue is discarded.
    pub fn flush(&mut self) -> Result<Option<Bytes>> {
        let count = self.queue.len();
        let entries_len = std::mem::take(&mut self.entries_len);
        let frame = match count {
            0 => return Ok(None),
            1 => self.queue.pop_front(),
            _ => {
                let mut enc = BitEncoder::with_capacity(container_len(count, entries_len));
                enc.write_u32(ID_BATCH);
                enc.write_var_u32(count as u32);
                for message in self.queue.drain(..) {
                    enc.write_byte_block(&message)?;
                }
                Some(enc.freeze())
            }
        };
        if let Some(frame) = &frame {
            tracing::trace!(messages = count, bytes = frame.len(), "batch: flushed");
        }
        Ok(frame)
    }
}

fn entry_len(len: usize) -> usize {
    varint::unsigned_len(len as u64) + len
}

fn container_len(count: usize, entries_len: usize) -> usize {
    TAG_BYTES + varint::unsigned_len(count as u64) + entries_len
}

/// Splits a batch container (tag included) into its messages.
pub fn split_batch(frame: Bytes) -> Result<Vec<Bytes>> {
    let total = frame.len();
    let mut dec = BitDecoder::new(frame);
    let tag = dec.read_u32()?;
    if tag != ID_BATCH {
        return Err(SessionError::UnexpectedFrame(tag));
    }
    let count = dec.read_var_u32()? as usize;
    // Every entry takes at least its one-byte length prefix.
    if count > dec.remaining() {
        return Err(SessionError::BatchCount {
            count,
            remaining: dec.remaining(),
        });
    }
    let mut messages = Vec::with_capacity(count);
    for _ in 0..count {
        messages.push(dec.read_byte_block(total)?);
    }
    if dec.has_remaining() {
        return Err(SessionError::TrailingBytes(dec.remaining()));
    }
    Ok(messages)
}
