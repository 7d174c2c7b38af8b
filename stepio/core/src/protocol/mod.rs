//! Wire Protocol
//!
//! Codec for the two messages that cross a node socket:
//! - `Handshake`: sent once by the node immediately after connecting
//! - `FrameHeader`: prefixes every stdio slice afterwards
//!
//! All integers are big-endian. Decoding never touches a socket except in
//! `read_handshake`, which gathers one length-prefixed handshake.

pub mod handshake;
pub mod header;

pub use handshake::{read_handshake, Handshake, IO_PROTOCOL_VERSION, MAX_HANDSHAKE_LEN};
pub use header::{FrameHeader, FrameKind, HEADER_LEN, MAX_PAYLOAD_LEN};
