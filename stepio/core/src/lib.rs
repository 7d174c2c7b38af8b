//! stepio Core - Client-Side Stdio Forwarding for Parallel Job Steps
//!
//! When a launcher starts a job step across many nodes, every remote task's
//! stdout and stderr has to come back to the launcher, and the launcher's
//! stdin has to reach the tasks. This crate is that plumbing: it accepts a
//! TCP connection from each node's agent, validates its handshake, and
//! moves framed output and input between those sockets and local
//! descriptors, while nodes connect late, fail, or get marked down.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────── launcher thread ──────────────────────────┐
//! │  Controller::create / start / finish / destroy                       │
//! │  mark_nodes_down · abort · send_connection_test · wait_for_*         │
//! └──────────────┬──────────────────────────────────┬───────────────────┘
//!                │ Command (mpsc wake channel)      │ Mutex<pools + node sets>
//! ┌──────────────┴──────────────────────────────────┴───────────────────┐
//! │                     event-loop thread (LocalSet)                     │
//! │                                                                      │
//! │  Listener ──handshake──► NodeConnection × N ──route──► writers ──► stdout/stderr/files
//! │                               ▲                                      │
//! │  stdin ──► StdinBridge ───────┘ (AllStdin / Stdin frames)           │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Memory is bounded by two capped [`buffer::BufferPool`]s. An exhausted
//! incoming pool suspends node reads until a writer catches up; an
//! exhausted outgoing pool suspends stdin.
//!
//! # Wire Format
//!
//! Big-endian throughout. A node opens with a length-prefixed handshake:
//!
//! ```text
//! u32 len | u16 version | u32 node_id | u32 sig_len | sig | u32 stdout_streams | u32 stderr_streams
//! ```
//!
//! then exchanges frames:
//!
//! ```text
//! u16 kind | u16 global_task_id | u16 local_task_id | u32 length | payload[length]
//! ```
//!
//! A zero-length stdout/stderr/stdin frame ends that stream.
//!
//! # Output Files
//!
//! [`OutputTarget::File`] takes a pattern: `%t` task id, `%n` node id, `%N`
//! hostname, `%j` job id, `%s` step id, `%%` a percent sign, with optional
//! zero-padding width (`%4t`). `%t` opens one file per task, `%n`/`%N` one
//! per node, anything else a single file.
//!
//! # Module Overview
//!
//! - [`protocol`]: frame header and handshake codec
//! - [`buffer`]: ref-counted buffer pools
//! - [`bridge`]: local stdin/stdout/stderr routing types
//! - [`controller`]: lifecycle and failure injection
//! - [`config`]: tunables from file and environment
//! - [`step`]: step shape and launcher collaborators
//! - [`sim`]: blocking node-agent simulator
//! - [`error`]: error types

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bridge;
pub mod buffer;
pub mod config;
pub mod controller;
pub mod error;
pub mod protocol;
pub mod sim;
pub mod step;

mod event_loop;
mod listener;
mod node;
mod shared;

pub use bridge::{LocalIo, OutputTarget, StdinSource, StdinTarget};
pub use buffer::{Buffer, BufferPool, PoolKind, SharedBuffer, BUFFER_CAPACITY};
pub use config::{default_config_path, ConfigError, IoConfig, OpenMode};
pub use controller::{Controller, IoStats, PoolStats};
pub use error::{
    HandshakeError, PoolError, ProtocolError, StepIoError, TransportError, ValidationError,
};
pub use protocol::{
    FrameHeader, FrameKind, Handshake, HEADER_LEN, IO_PROTOCOL_VERSION, MAX_PAYLOAD_LEN,
};
pub use step::{
    BlockLayout, Collaborators, CredentialProvider, NodeFailureHandler, StaticCredential,
    StepLayout, StepParams,
};
