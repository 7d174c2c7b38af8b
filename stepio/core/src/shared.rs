//! State Shared Between the Launcher Thread and the Event Loop
//!
//! The two buffer pools and the node sets are the only state both threads
//! touch. They sit behind one `parking_lot::Mutex`, held for a list splice or
//! a bit flip and never across an await. Everything else the event loop owns
//! outright.
//!
//! Waking goes two ways:
//! - `Condvar` for launcher-thread waits (`wait_for_connections`, ...)
//! - `Notify` for event-loop tasks suspended on an empty pool or on node
//!   readiness

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::buffer::{Buffer, BufferPool, PoolKind, SharedBuffer};
use crate::config::IoConfig;

/// Fixed-size set of node ids
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSet {
    words: Vec<u64>,
    len: u32,
}

impl NodeSet {
    /// Empty set able to hold ids `0..len`
    #[must_use]
    pub fn new(len: u32) -> Self {
        Self {
            words: vec![0; (len as usize).div_ceil(64)],
            len,
        }
    }

    /// Insert an id; returns `false` if it was already present
    pub fn insert(&mut self, id: u32) -> bool {
        if id >= self.len {
            return false;
        }
        let (word, bit) = (id as usize / 64, id % 64);
        let was = self.words[word] & (1 << bit) != 0;
        self.words[word] |= 1 << bit;
        !was
    }

    /// Membership test
    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        id < self.len && self.words[id as usize / 64] & (1 << (id % 64)) != 0
    }

    /// Members
    #[must_use]
    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// True when every id is present
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.count() == self.len
    }

    /// Iterate over ids not in the set
    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |&id| !self.contains(id))
    }
}

/// Mutex-guarded state
#[derive(Debug)]
pub(crate) struct SharedState {
    pub incoming: BufferPool,
    pub outgoing: BufferPool,
    /// Handshake accepted
    pub connected: NodeSet,
    /// Connected or marked down; nothing waits on these any more
    pub ready: NodeSet,
    /// Marked down by the launcher
    pub down: NodeSet,
    /// No further I/O with this node
    pub finished: NodeSet,
    /// Set once the event loop begins shutting down
    pub shutting_down: bool,
}

pub(crate) struct Shared {
    state: Mutex<SharedState>,
    changed: Condvar,
    /// An incoming buffer went back on the free list
    pub incoming_freed: Notify,
    /// An outgoing buffer went back on the free list
    pub outgoing_freed: Notify,
    /// Some node connected, finished, or was marked down
    pub nodes_changed: Notify,
    /// Some outbound queue shrank
    pub outbound_drained: Notify,
}

impl Shared {
    pub fn new(config: &IoConfig, node_count: u32) -> Self {
        let mut incoming = BufferPool::new(PoolKind::Incoming, config.incoming_buffer_cap);
        let mut outgoing = BufferPool::new(PoolKind::Outgoing, config.outgoing_buffer_cap);
        incoming.prewarm(config.prewarm_buffers);
        outgoing.prewarm(config.prewarm_buffers);

        Self {
            state: Mutex::new(SharedState {
                incoming,
                outgoing,
                connected: NodeSet::new(node_count),
                ready: NodeSet::new(node_count),
                down: NodeSet::new(node_count),
                finished: NodeSet::new(node_count),
                shutting_down: false,
            }),
            changed: Condvar::new(),
            incoming_freed: Notify::new(),
            outgoing_freed: Notify::new(),
            nodes_changed: Notify::new(),
            outbound_drained: Notify::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock()
    }

    /// Mutate node sets and wake everyone who waits on them
    pub fn update_nodes<R>(&self, f: impl FnOnce(&mut SharedState) -> R) -> R {
        let result = {
            let mut state = self.state.lock();
            f(&mut state)
        };
        self.changed.notify_all();
        self.nodes_changed.notify_waiters();
        result
    }

    /// Block the calling (non-loop) thread until `pred` holds or time runs out
    pub fn wait_until(&self, timeout: Duration, pred: impl Fn(&SharedState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !pred(&state) {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return pred(&state);
            }
        }
        true
    }

    /// Incoming buffer, suspending while the pool is exhausted
    pub async fn acquire_incoming(&self) -> Buffer {
        loop {
            let notified = self.incoming_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let acquired = self.state.lock().incoming.acquire();
            if let Some(buffer) = acquired {
                return buffer;
            }
            tracing::trace!("Incoming pool exhausted; read side suspended");
            notified.await;
        }
    }

    /// Outgoing buffer, suspending while the pool is exhausted
    pub async fn acquire_outgoing(&self) -> Buffer {
        loop {
            let notified = self.outgoing_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let acquired = self.state.lock().outgoing.acquire();
            if let Some(buffer) = acquired {
                return buffer;
            }
            tracing::trace!("Outgoing pool exhausted; stdin suspended");
            notified.await;
        }
    }

    pub fn try_acquire_outgoing(&self) -> Option<Buffer> {
        self.state.lock().outgoing.acquire()
    }

    pub fn release_incoming(&self, buffer: Buffer) {
        if let Err(e) = self.state.lock().incoming.release(buffer) {
            tracing::error!(error = %e, "Incoming buffer release rejected");
        }
        self.incoming_freed.notify_waiters();
    }

    pub fn release_outgoing(&self, buffer: SharedBuffer) {
        match self.state.lock().outgoing.release_shared(buffer) {
            Ok(true) => self.outgoing_freed.notify_waiters(),
            Ok(false) => {}
            Err(e) => tracing::error!(error = %e, "Outgoing buffer release rejected"),
        }
    }

    pub fn release_outgoing_exclusive(&self, buffer: Buffer) {
        if let Err(e) = self.state.lock().outgoing.release(buffer) {
            tracing::error!(error = %e, "Outgoing buffer release rejected");
        }
        self.outgoing_freed.notify_waiters();
    }

    pub fn share_outgoing(&self, buffer: Buffer, holders: usize) -> Vec<SharedBuffer> {
        let shares = self.state.lock().outgoing.share(buffer, holders);
        if shares.is_empty() {
            self.outgoing_freed.notify_waiters();
        }
        shares
    }
}
