//! Outbound queue of one node connection
//!
//! FIFO of shared stdin buffers plus the byte offset already written from
//! the head. Capacity is counted in payload bytes so the stdin bridge can
//! size its next chunk to the tightest queue.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::buffer::{Buffer, SharedBuffer};

/// Write-side state of a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WritePhase {
    /// Nothing queued
    Idle,
    /// Head buffer partially or not yet written
    Draining,
}

#[derive(Debug)]
pub(crate) struct OutboundQueue {
    queue: VecDeque<SharedBuffer>,
    /// Bytes of the head buffer's wire form already sent
    head_offset: usize,
    queued_bytes: usize,
    capacity_bytes: usize,
}

impl OutboundQueue {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            head_offset: 0,
            queued_bytes: 0,
            capacity_bytes,
        }
    }

    pub fn phase(&self) -> WritePhase {
        if self.queue.is_empty() {
            WritePhase::Idle
        } else {
            WritePhase::Draining
        }
    }

    /// Payload bytes that can still be queued
    pub fn free_space(&self) -> usize {
        self.capacity_bytes.saturating_sub(self.queued_bytes)
    }

    pub fn push(&mut self, buffer: SharedBuffer) {
        self.queued_bytes += buffer.header().payload_len();
        self.queue.push_back(buffer);
    }

    /// Head buffer and the offset to resume writing from
    pub fn head(&self) -> Option<(Arc<Buffer>, usize)> {
        self.queue
            .front()
            .map(|buffer| (buffer.peek(), self.head_offset))
    }

    /// Record `n` bytes written from the head
    ///
    /// Returns the head once it is fully on the wire; the caller releases it.
    pub fn advance(&mut self, n: usize) -> Option<SharedBuffer> {
        let wire_len = self.queue.front()?.wire().len();
        self.head_offset += n;
        if self.head_offset < wire_len {
            return None;
        }

        self.head_offset = 0;
        let done = self.queue.pop_front()?;
        self.queued_bytes -= done.header().payload_len();
        Some(done)
    }

    /// Empty the queue, handing every buffer back for release
    pub fn drain_all(&mut self) -> Vec<SharedBuffer> {
        self.head_offset = 0;
        self.queued_bytes = 0;
        self.queue.drain(..).collect()
    }
}
