//! Outbound audio framing and the pre-connection queue
//!
//! Buffers submitted before the live channel is ready are kept verbatim and
//! only framed when the queue is flushed, so the bytes on the wire are the
//! concatenation of submissions in order.
//!
//! The queue is unbounded. Memory grows with however much audio the caller
//! submits while the channel is down.

use std::collections::VecDeque;

/// Split a buffer into consecutive frames of at most `max_frame_bytes`.
///
/// An empty buffer yields no frames. A zero frame size is treated as 1.
pub fn frame_audio(buffer: &[u8], max_frame_bytes: usize) -> std::slice::Chunks<'_, u8> {
    buffer.chunks(max_frame_bytes.max(1))
}

/// FIFO of raw buffers submitted before the channel became ready.
///
/// Thread-safety: not internally synchronized. The transport actor is the
/// only owner.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    items: VecDeque<Vec<u8>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer verbatim.
    pub fn push(&mut self, data: Vec<u8>) {
        self.items.push_back(data);
    }

    /// Remove every queued buffer, unframed, in submission order.
    pub fn drain_all(&mut self) -> Vec<Vec<u8>> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
