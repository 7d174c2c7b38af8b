//! Node Connection Driver
//!
//! Runs one registered node's socket until the node is done with us:
//!
//! ```text
//!   ┌──────────────┐  all streams ended  ┌──────────┐
//!   │   running    │────────────────────►│ complete │
//!   │ read ∥ write │                     └──────────┘
//!   └──────┬───────┘
//!          │ transport / protocol error ──► failed (node-failure callback)
//!          │ marked down / abort / loop shutdown ──► shut down (no callback)
//! ```
//!
//! Whatever the exit, the socket is closed once, the partial incoming
//! buffer and every queued outbound buffer go back to their pools, and the
//! node is added to the finished set.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::rc::Rc;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use super::outbound::{OutboundQueue, WritePhase};
use super::reader::{FrameReader, ReadStep, RemoteStreams};
use crate::bridge::output::Router;
use crate::buffer::SharedBuffer;
use crate::error::TransportError;
use crate::shared::Shared;
use crate::step::Collaborators;

/// Why the launcher ended a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ShutdownReason {
    MarkedDown,
    Aborted,
    LoopShutdown,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MarkedDown => f.write_str("marked down"),
            Self::Aborted => f.write_str("aborted"),
            Self::LoopShutdown => f.write_str("event loop shutdown"),
        }
    }
}

/// Loop-side view of one connection, shared with the stdin bridge
pub(crate) struct NodeHandle {
    node_id: u32,
    outbound: RefCell<OutboundQueue>,
    write_ready: Notify,
    shutdown: Notify,
    shutdown_reason: Cell<Option<ShutdownReason>>,
    streams: Cell<RemoteStreams>,
    write_eof: Cell<bool>,
    finished: Cell<bool>,
}

impl NodeHandle {
    pub fn new(node_id: u32, streams: RemoteStreams, queue_bytes: usize) -> Self {
        Self {
            node_id,
            outbound: RefCell::new(OutboundQueue::new(queue_bytes)),
            write_ready: Notify::new(),
            shutdown: Notify::new(),
            shutdown_reason: Cell::new(None),
            streams: Cell::new(streams),
            write_eof: Cell::new(false),
            finished: Cell::new(false),
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }

    pub fn streams(&self) -> RemoteStreams {
        self.streams.get()
    }

    pub fn accepts_stdin(&self) -> bool {
        !self.write_eof.get() && self.shutdown_reason.get().is_none()
    }

    /// Payload bytes the outbound queue can still take
    pub fn free_space(&self) -> usize {
        if self.accepts_stdin() {
            self.outbound.borrow().free_space()
        } else {
            0
        }
    }

    /// Queue a frame for the node; hands it back if the write side is closed
    pub fn enqueue(&self, buffer: SharedBuffer) -> Result<(), SharedBuffer> {
        if !self.accepts_stdin() {
            return Err(buffer);
        }
        self.outbound.borrow_mut().push(buffer);
        self.write_ready.notify_one();
        Ok(())
    }

    /// End the connection at its next wake-up
    ///
    /// The first reason wins. Remote stream counters are forced to zero.
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        if self.finished.get() || self.shutdown_reason.get().is_some() {
            return;
        }
        self.shutdown_reason.set(Some(reason));
        let mut streams = self.streams.get();
        streams.force_closed();
        self.streams.set(streams);
        self.shutdown.notify_one();
    }
}

/// What every connection task needs from the loop
pub(crate) struct ConnectionEnv {
    pub shared: Arc<Shared>,
    pub router: RefCell<Router>,
    pub collab: Collaborators,
}

enum Exit {
    Complete,
    Shutdown(ShutdownReason),
}

enum Event {
    Shutdown,
    Read(Result<Option<ReadStep>, TransportError>),
    Written(io::Result<()>),
}

/// Run a registered node's connection to completion
pub(crate) async fn drive(handle: Rc<NodeHandle>, mut stream: TcpStream, env: Rc<ConnectionEnv>) {
    let node_id = handle.node_id;
    let mut reader = FrameReader::new();

    let outcome = {
        let (mut rd, mut wr) = stream.split();
        run(&handle, &env, &mut reader, &mut rd, &mut wr).await
    };

    handle.write_eof.set(true);
    handle.finished.set(true);
    if let Some(buffer) = reader.take_buffer() {
        env.shared.release_incoming(buffer);
    }
    let queued = handle.outbound.borrow_mut().drain_all();
    let dropped = queued.len();
    for buffer in queued {
        env.shared.release_outgoing(buffer);
    }
    env.shared.outbound_drained.notify_waiters();
    if let Err(e) = stream.shutdown().await {
        tracing::trace!(node_id, error = %e, "Socket shutdown failed");
    }
    drop(stream);

    env.shared.update_nodes(|state| {
        state.finished.insert(node_id);
    });

    match outcome {
        Ok(Exit::Complete) => {
            tracing::debug!(node_id, dropped_stdin = dropped, "Node connection complete");
        }
        Ok(Exit::Shutdown(reason)) => {
            tracing::info!(node_id, %reason, dropped_stdin = dropped, "Node connection shut down");
        }
        Err(e) => {
            let hostname = env.collab.layout.hostname(node_id);
            tracing::error!(node_id, hostname = %hostname, error = %e, "Node connection failed");
            env.collab.on_node_failure.node_failed(node_id, &hostname);
        }
    }
}

async fn run(
    handle: &NodeHandle,
    env: &ConnectionEnv,
    reader: &mut FrameReader,
    rd: &mut ReadHalf<'_>,
    wr: &mut WriteHalf<'_>,
) -> Result<Exit, TransportError> {
    loop {
        if let Some(reason) = handle.shutdown_reason.get() {
            return Ok(Exit::Shutdown(reason));
        }

        let event = tokio::select! {
            biased;
            () = handle.shutdown.notified() => Event::Shutdown,
            step = read_frame(&env.shared, reader, rd) => Event::Read(step),
            written = write_some(handle, &env.shared, wr) => Event::Written(written),
        };

        match event {
            Event::Shutdown => {}
            Event::Written(result) => result?,
            Event::Read(Err(e)) => return Err(e),
            Event::Read(Ok(None)) => {
                let streams = handle.streams();
                if !reader.at_frame_boundary() {
                    return Err(TransportError::UnexpectedEof);
                }
                if !streams.all_closed() {
                    return Err(TransportError::ClosedWithOpenStreams {
                        stdout: streams.stdout,
                        stderr: streams.stderr,
                    });
                }
                return Ok(Exit::Complete);
            }
            Event::Read(Ok(Some(step))) => match step {
                ReadStep::Pending => {}
                ReadStep::Probe => {
                    tracing::trace!(node_id = handle.node_id, "Connection test frame from node");
                }
                ReadStep::EndOfStream(header) => {
                    let mut streams = handle.streams.get();
                    let all_closed = streams.close(header.kind);
                    handle.streams.set(streams);
                    tracing::debug!(
                        node_id = handle.node_id,
                        task = header.global_task_id,
                        kind = %header.kind,
                        "Remote stream ended"
                    );
                    if all_closed {
                        return Ok(Exit::Complete);
                    }
                }
                ReadStep::Payload(buffer) => {
                    tracing::trace!(
                        node_id = handle.node_id,
                        task = buffer.header().global_task_id,
                        len = buffer.payload().len(),
                        "Routing frame"
                    );
                    env.router.borrow().route(buffer, handle.node_id);
                }
            },
        }
    }
}

/// Advance the read side by one socket read
///
/// `Ok(None)` is EOF. Suspends first if the incoming pool is exhausted.
async fn read_frame(
    shared: &Shared,
    reader: &mut FrameReader,
    rd: &mut ReadHalf<'_>,
) -> Result<Option<ReadStep>, TransportError> {
    if reader.needs_buffer() {
        reader.give_buffer(shared.acquire_incoming().await);
    }
    let n = rd.read(reader.read_target()).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(reader.advance(n)?))
}

/// Write as much of the head buffer as the socket takes
///
/// Waits while the queue is empty.
async fn write_some(handle: &NodeHandle, shared: &Shared, wr: &mut WriteHalf<'_>) -> io::Result<()> {
    loop {
        let head = handle.outbound.borrow().head();
        let Some((buffer, offset)) = head else {
            handle.write_ready.notified().await;
            continue;
        };

        let n = wr.write(&buffer.wire()[offset..]).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }

        let done = handle.outbound.borrow_mut().advance(n);
        if let Some(done) = done {
            shared.release_outgoing(done);
            shared.outbound_drained.notify_waiters();
        }
        if handle.outbound.borrow().phase() == WritePhase::Idle {
            wr.flush().await?;
        }
        return Ok(());
    }
}
