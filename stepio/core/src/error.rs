//! Error Types
//!
//! One enum per failure class. Per-connection errors (`ProtocolError`,
//! `ValidationError`, `HandshakeError`, `TransportError`) are handled inside
//! the event loop and never stop it; only `StepIoError` is returned to the
//! launcher from `Controller` operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::buffer::PoolKind;
use crate::config::ConfigError;
use crate::protocol::FrameKind;

/// Malformed data on the wire
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame header carries a kind outside the enumerated set
    #[error("Unknown frame kind {0}")]
    UnknownKind(u16),

    /// Frame header announces more payload than a buffer can hold
    #[error("Frame length {length} exceeds maximum {max}")]
    Oversized {
        /// Announced payload length
        length: u32,
        /// Protocol maximum
        max: usize,
    },

    /// A node sent a frame kind that only flows launcher -> node
    #[error("Unexpected {0} frame from node")]
    UnexpectedKind(FrameKind),

    /// Handshake body ended early
    #[error("Handshake truncated: needed {needed} bytes, had {available}")]
    Truncated {
        /// Bytes required to continue decoding
        needed: usize,
        /// Bytes actually left
        available: usize,
    },

    /// Handshake length prefix above the accepted bound
    #[error("Handshake length {length} exceeds maximum {max}")]
    HandshakeTooLarge {
        /// Announced body length
        length: u32,
        /// Accepted maximum
        max: usize,
    },

    /// Bytes left over after the last handshake field
    #[error("Handshake has {0} trailing bytes")]
    TrailingBytes(usize),
}

/// A well-formed handshake that must not be accepted
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Peer speaks a different protocol revision
    #[error("Protocol version {found:#06x} does not match {expected:#06x}")]
    VersionMismatch {
        /// Version this engine speaks
        expected: u16,
        /// Version the peer sent
        found: u16,
    },

    /// Signature differs from the job credential
    #[error("Invalid handshake signature from node {node_id}")]
    SignatureMismatch {
        /// Node id claimed by the peer
        node_id: u32,
    },

    /// Node id not part of this step
    #[error("Node id {node_id} out of range (step has {node_count} nodes)")]
    NodeOutOfRange {
        /// Node id claimed by the peer
        node_id: u32,
        /// Nodes in the step
        node_count: u32,
    },

    /// A connection for this node is already registered
    #[error("Node {0} is already connected")]
    DuplicateNode(u32),

    /// The node was marked down before it connected
    #[error("Node {0} was marked down")]
    NodeDown(u32),
}

/// Failure while accepting a node's handshake
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Socket error while reading
    #[error("IO error reading handshake: {0}")]
    Io(#[from] io::Error),

    /// Peer did not send its handshake in time
    #[error("Timed out waiting for handshake")]
    Timeout,

    /// Malformed handshake
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Handshake rejected
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Failure of an established node connection
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket read or write failed
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Socket closed in the middle of a frame
    #[error("Connection closed mid-frame")]
    UnexpectedEof,

    /// Socket closed while the node still had open output streams
    #[error("Connection closed with {stdout} stdout and {stderr} stderr streams open")]
    ClosedWithOpenStreams {
        /// Stdout streams not yet ended
        stdout: u32,
        /// Stderr streams not yet ended
        stderr: u32,
    },

    /// Node sent something that cannot be parsed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Misuse of a buffer pool
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Release of a buffer whose reference count is already zero
    #[error("Buffer {id} released to the {pool} pool with reference count already zero")]
    DoubleRelease {
        /// Pool the buffer was released to
        pool: PoolKind,
        /// Buffer slot
        id: usize,
    },

    /// Buffer handed to a pool that did not allocate it
    #[error("Buffer {id} does not belong to the {pool} pool")]
    ForeignBuffer {
        /// Pool the buffer was released to
        pool: PoolKind,
        /// Buffer slot
        id: usize,
    },
}

/// Errors returned from `Controller` operations
#[derive(Debug, Error)]
pub enum StepIoError {
    /// Step parameters are inconsistent
    #[error("Invalid step parameters: {0}")]
    InvalidParams(String),

    /// No listening socket could be bound
    #[error("Failed to bind any listening socket: {0}")]
    Bind(#[source] io::Error),

    /// The event-loop runtime could not be created
    #[error("Failed to build event loop runtime: {0}")]
    Runtime(#[source] io::Error),

    /// A local output or input file could not be opened
    #[error("Failed to open {path}: {source}")]
    OpenFile {
        /// File path after pattern expansion
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// The event-loop thread could not be spawned
    #[error("Failed to spawn event loop thread: {0}")]
    Spawn(#[source] io::Error),

    /// `start` called twice
    #[error("Event loop already started")]
    AlreadyStarted,

    /// `destroy` called while the loop still runs
    #[error("Event loop is still running; call finish() first")]
    StillRunning,

    /// The event-loop thread exited before it finished starting
    #[error("Event loop exited before it was ready")]
    LoopStartFailed,

    /// The event-loop thread panicked
    #[error("Event loop thread panicked")]
    LoopPanicked,

    /// Configuration could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),
}
