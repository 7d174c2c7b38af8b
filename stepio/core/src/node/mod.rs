//! Node Connections
//!
//! One task per registered node drives its socket in both directions:
//! - read side: [`reader::FrameReader`] turns bytes into routed frames
//! - write side: [`outbound::OutboundQueue`] drains stdin buffers in order
//!
//! Both sides are explicit state machines that never touch the socket, so
//! they are tested without one. [`connection`] glues them to a `TcpStream`.

pub(crate) mod connection;
pub(crate) mod outbound;
pub(crate) mod reader;

use std::cell::RefCell;
use std::rc::Rc;

pub(crate) use connection::{drive, ConnectionEnv, NodeHandle, ShutdownReason};

/// Node handles by node id, owned by the event loop
pub(crate) struct NodeRegistry {
    slots: RefCell<Vec<Option<Rc<NodeHandle>>>>,
}

impl NodeRegistry {
    pub fn new(node_count: u32) -> Self {
        Self {
            slots: RefCell::new(vec![None; node_count as usize]),
        }
    }

    pub fn get(&self, node_id: u32) -> Option<Rc<NodeHandle>> {
        self.slots.borrow().get(node_id as usize).cloned().flatten()
    }

    /// Register a handle; `false` if the slot is taken or out of range
    pub fn insert(&self, handle: Rc<NodeHandle>) -> bool {
        let mut slots = self.slots.borrow_mut();
        match slots.get_mut(handle.node_id() as usize) {
            Some(slot @ None) => {
                *slot = Some(handle);
                true
            }
            _ => false,
        }
    }

    /// Every registered handle, finished or not
    pub fn all(&self) -> Vec<Rc<NodeHandle>> {
        self.slots.borrow().iter().flatten().cloned().collect()
    }

    /// Handles among `ids` that still take stdin
    pub fn accepting_stdin(&self, ids: &[u32]) -> Vec<Rc<NodeHandle>> {
        ids.iter()
            .filter_map(|&id| self.get(id))
            .filter(|handle| handle.accepts_stdin())
            .collect()
    }
}
