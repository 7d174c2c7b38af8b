//! Listener
//!
//! Binds the listening sockets at `create` and accepts node connections on
//! the event loop. Every accepted socket gets its own handshake task under
//! `handshake_timeout`, so a silent or hostile peer only ever holds up
//! itself.
//!
//! A handshake is accepted when it parses, matches the protocol version,
//! names a node of this step, carries the job signature, and the node is
//! neither connected already nor marked down. Anything else is logged and
//! the socket dropped; the step carries on.

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::rc::Rc;

use tokio::net::{TcpListener, TcpStream};

use crate::config::IoConfig;
use crate::error::{HandshakeError, ValidationError};
use crate::node::reader::RemoteStreams;
use crate::node::{drive, ConnectionEnv, NodeHandle, NodeRegistry};
use crate::protocol::{read_handshake, Handshake};

/// Bind `listener_count(node_count)` sockets
///
/// Individual failures are logged; only failing to bind any socket at all
/// is an error.
pub(crate) fn bind_listeners(config: &IoConfig, node_count: u32) -> io::Result<Vec<StdTcpListener>> {
    let wanted = config.listener_count(node_count);
    let mut bound = Vec::with_capacity(wanted);
    let mut next_port = config.port_range.map(|(low, _)| low);
    let mut last_error = None;

    for index in 0..wanted {
        let result = match config.port_range {
            None => StdTcpListener::bind(SocketAddr::new(config.bind_addr, 0)),
            Some((_, high)) => bind_in_range(config, &mut next_port, high),
        };
        match result.and_then(|listener| {
            listener.set_nonblocking(true)?;
            Ok(listener)
        }) {
            Ok(listener) => bound.push(listener),
            Err(e) => {
                tracing::warn!(index, error = %e, "Failed to bind listening socket");
                last_error = Some(e);
            }
        }
    }

    if bound.is_empty() {
        return Err(last_error.unwrap_or_else(|| io::Error::other("no listening sockets requested")));
    }
    if bound.len() < wanted {
        tracing::warn!(bound = bound.len(), wanted, "Listening with fewer sockets than requested");
    }
    Ok(bound)
}

fn bind_in_range(config: &IoConfig, next_port: &mut Option<u16>, high: u16) -> io::Result<StdTcpListener> {
    let mut last_error = io::Error::new(io::ErrorKind::AddrInUse, "port range exhausted");
    while let Some(port) = *next_port {
        *next_port = port.checked_add(1).filter(|&p| p <= high);
        match StdTcpListener::bind(SocketAddr::new(config.bind_addr, port)) {
            Ok(listener) => return Ok(listener),
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

/// Everything the accept path needs, owned by the event loop
pub(crate) struct Acceptor {
    pub env: Rc<ConnectionEnv>,
    pub nodes: Rc<NodeRegistry>,
    pub signature: Vec<u8>,
    pub node_count: u32,
    pub config: IoConfig,
}

impl Acceptor {
    /// Accept forever on one socket
    pub async fn accept_loop(self: Rc<Self>, listener: TcpListener) {
        let local = listener.local_addr().ok();
        tracing::debug!(addr = ?local, "Accepting node connections");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tokio::task::spawn_local(Rc::clone(&self).accept_node(stream, peer));
                }
                Err(e) => {
                    tracing::warn!(addr = ?local, error = %e, "Accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        }
    }

    async fn accept_node(self: Rc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        let timeout = self.config.handshake_timeout();
        let handshake = match tokio::time::timeout(timeout, read_handshake(&mut stream)).await {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::Timeout),
        };

        let handshake = match handshake.and_then(|h| self.admit(&h).map(|()| h)) {
            Ok(handshake) => handshake,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Rejected node connection");
                return;
            }
        };

        let node_id = handshake.node_id;
        let handle = Rc::new(NodeHandle::new(
            node_id,
            RemoteStreams::new(handshake.stdout_streams, handshake.stderr_streams),
            self.config.outbound_queue_bytes,
        ));
        if !self.nodes.insert(Rc::clone(&handle)) {
            // admit() already rejects duplicates under the shared lock
            tracing::error!(node_id, "Node slot unexpectedly occupied");
            return;
        }
        self.env.shared.update_nodes(|state| {
            state.ready.insert(node_id);
        });

        tracing::info!(
            node_id,
            peer = %peer,
            stdout_streams = handshake.stdout_streams,
            stderr_streams = handshake.stderr_streams,
            "Node connected"
        );
        tokio::task::spawn_local(drive(handle, stream, Rc::clone(&self.env)));
    }

    /// Validate and claim the node's `connected` bit
    fn admit(&self, handshake: &Handshake) -> Result<(), HandshakeError> {
        handshake.validate(&self.signature, self.node_count)?;
        let node_id = handshake.node_id;

        let mut state = self.env.shared.lock();
        if state.shutting_down || state.down.contains(node_id) {
            return Err(ValidationError::NodeDown(node_id).into());
        }
        if !state.connected.insert(node_id) {
            return Err(ValidationError::DuplicateNode(node_id).into());
        }
        Ok(())
    }
}
