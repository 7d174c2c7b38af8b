//! Buffer Pool
//!
//! Fixed-capacity, reference-counted message buffers recycled through a free
//! list. A pool allocates lazily up to its cap and never frees; an empty pool
//! at its cap makes `acquire` return `None`, which is the backpressure signal
//! that suspends whichever side wanted the buffer.
//!
//! # Ownership
//!
//! ```text
//!   acquire() ──► Buffer (exclusive, writable)
//!                   │
//!                   ├── release(buffer) ───────────────► free list
//!                   │
//!                   └── share(buffer, n) ──► n × SharedBuffer (read-only)
//!                                              │
//!                                              └── release_shared() × n ──► free list (once)
//! ```
//!
//! Neither handle implements `Clone`, so release is the only way a buffer
//! gets back to its pool. The pool keeps the reference count for every slot
//! it allocated and rejects a release when that count is already zero.

use std::fmt;
use std::sync::Arc;

use crate::error::PoolError;
use crate::protocol::{FrameHeader, FrameKind, HEADER_LEN, MAX_PAYLOAD_LEN};

/// Bytes backing one buffer: room for an encoded header plus a full payload
pub const BUFFER_CAPACITY: usize = HEADER_LEN + MAX_PAYLOAD_LEN;

/// Which direction a pool serves
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Frames flowing node -> launcher
    Incoming,
    /// Frames flowing launcher -> node
    Outgoing,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incoming => f.write_str("incoming"),
            Self::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// Exclusively owned message buffer
pub struct Buffer {
    id: usize,
    pool: PoolKind,
    header: FrameHeader,
    data: Box<[u8]>,
}

impl Buffer {
    fn new(id: usize, pool: PoolKind) -> Self {
        Self {
            id,
            pool,
            header: FrameHeader::control(FrameKind::Stdout),
            data: vec![0u8; BUFFER_CAPACITY].into_boxed_slice(),
        }
    }

    /// Slot id within its pool
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Pool that owns this buffer
    #[must_use]
    pub fn pool(&self) -> PoolKind {
        self.pool
    }

    /// Header of the frame this buffer carries
    #[must_use]
    pub fn header(&self) -> FrameHeader {
        self.header
    }

    /// Payload bytes, as long as the header says
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data[HEADER_LEN..HEADER_LEN + self.header.payload_len()]
    }

    /// Whole payload area, for filling before `seal`
    pub fn payload_area_mut(&mut self) -> &mut [u8] {
        &mut self.data[HEADER_LEN..]
    }

    /// Header plus payload exactly as sent on the wire
    #[must_use]
    pub fn wire(&self) -> &[u8] {
        &self.data[..HEADER_LEN + self.header.payload_len()]
    }

    /// Attach a header; the encoded form is written in front of the payload
    ///
    /// # Panics
    ///
    /// Panics if the header's length exceeds `MAX_PAYLOAD_LEN`.
    pub fn seal(&mut self, header: FrameHeader) {
        assert!(header.payload_len() <= MAX_PAYLOAD_LEN);
        header.encode_into(&mut self.data[..HEADER_LEN]);
        self.header = header;
    }

    fn reset(&mut self) {
        self.header = FrameHeader::control(FrameKind::Stdout);
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("pool", &self.pool)
            .field("header", &self.header)
            .finish()
    }
}

/// Read-only buffer held by one of several queues
pub struct SharedBuffer {
    inner: Arc<Buffer>,
}

impl SharedBuffer {
    /// Slot id within its pool
    #[must_use]
    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Header of the frame this buffer carries
    #[must_use]
    pub fn header(&self) -> FrameHeader {
        self.inner.header
    }

    /// Payload bytes
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.inner.payload()
    }

    /// Header plus payload exactly as sent on the wire
    #[must_use]
    pub fn wire(&self) -> &[u8] {
        self.inner.wire()
    }

    /// Borrow the bytes across an await point without taking the handle
    /// out of its queue
    pub(crate) fn peek(&self) -> Arc<Buffer> {
        Arc::clone(&self.inner)
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedBuffer").field(&*self.inner).finish()
    }
}

/// Capped pool of recyclable buffers
pub struct BufferPool {
    kind: PoolKind,
    cap: usize,
    free: Vec<Buffer>,
    /// Outstanding holders per allocated slot; zero while on the free list
    refs: Vec<usize>,
}

impl BufferPool {
    /// Create an empty pool
    #[must_use]
    pub fn new(kind: PoolKind, cap: usize) -> Self {
        Self {
            kind,
            cap,
            free: Vec::new(),
            refs: Vec::new(),
        }
    }

    /// Allocate up to `count` buffers now, never past the cap
    pub fn prewarm(&mut self, count: usize) {
        let target = count.min(self.cap);
        while self.refs.len() < target {
            let id = self.refs.len();
            self.refs.push(0);
            self.free.push(Buffer::new(id, self.kind));
        }
    }

    /// Take a buffer, allocating if below the cap
    ///
    /// `None` means the pool is exhausted and the caller must wait for a
    /// release.
    pub fn acquire(&mut self) -> Option<Buffer> {
        if let Some(buffer) = self.free.pop() {
            self.refs[buffer.id] = 1;
            return Some(buffer);
        }
        if self.refs.len() < self.cap {
            let id = self.refs.len();
            self.refs.push(1);
            return Some(Buffer::new(id, self.kind));
        }
        None
    }

    /// Turn a filled buffer into `holders` read-only handles
    ///
    /// With zero holders the buffer goes straight back to the free list.
    pub fn share(&mut self, buffer: Buffer, holders: usize) -> Vec<SharedBuffer> {
        if holders == 0 {
            if let Err(e) = self.release(buffer) {
                tracing::error!(error = %e, "Failed to recycle unshared buffer");
            }
            return Vec::new();
        }

        self.refs[buffer.id] = holders;
        let inner = Arc::new(buffer);
        (0..holders)
            .map(|_| SharedBuffer {
                inner: Arc::clone(&inner),
            })
            .collect()
    }

    /// Return an exclusively held buffer
    pub fn release(&mut self, mut buffer: Buffer) -> Result<(), PoolError> {
        self.check(buffer.pool, buffer.id)?;
        self.refs[buffer.id] = 0;
        buffer.reset();
        self.free.push(buffer);
        Ok(())
    }

    /// Drop one holder of a shared buffer
    ///
    /// Returns `true` when this was the last holder and the buffer is back
    /// on the free list.
    pub fn release_shared(&mut self, buffer: SharedBuffer) -> Result<bool, PoolError> {
        let (pool, id) = (buffer.inner.pool, buffer.inner.id);
        self.check(pool, id)?;

        self.refs[id] -= 1;
        if self.refs[id] > 0 {
            return Ok(false);
        }

        match Arc::try_unwrap(buffer.inner) {
            Ok(mut buffer) => {
                buffer.reset();
                self.free.push(buffer);
            }
            Err(_still_peeked) => {
                // A writer still holds a peek; let that copy die with it and
                // put fresh memory in the slot.
                self.free.push(Buffer::new(id, self.kind));
            }
        }
        Ok(true)
    }

    fn check(&self, pool: PoolKind, id: usize) -> Result<(), PoolError> {
        if pool != self.kind || id >= self.refs.len() {
            return Err(PoolError::ForeignBuffer {
                pool: self.kind,
                id,
            });
        }
        if self.refs[id] == 0 {
            return Err(PoolError::DoubleRelease {
                pool: self.kind,
                id,
            });
        }
        Ok(())
    }

    /// Outstanding holders of a slot
    #[must_use]
    pub fn ref_count(&self, id: usize) -> usize {
        self.refs.get(id).copied().unwrap_or(0)
    }

    /// Hard allocation cap
    #[must_use]
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Buffers allocated so far
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.refs.len()
    }

    /// Buffers sitting on the free list
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// True when `acquire` would succeed
    #[must_use]
    pub fn has_available(&self) -> bool {
        !self.free.is_empty() || self.refs.len() < self.cap
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("kind", &self.kind)
            .field("cap", &self.cap)
            .field("allocated", &self.refs.len())
            .field("free", &self.free.len())
            .finish()
    }
}
