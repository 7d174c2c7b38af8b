//! Frame Header
//!
//! Every stdio slice on a node socket is a fixed 10-byte header followed by
//! `length` payload bytes.
//!
//! ```text
//! +-----------+-----------+-----------+----------------+-------------------+
//! | Kind (2)  | GTask (2) | LTask (2) | Length (4)     | Payload (Length)  |
//! | u16 BE    | u16 BE    | u16 BE    | u32 BE         |                   |
//! +-----------+-----------+-----------+----------------+-------------------+
//! ```
//!
//! A `Length` of zero marks the end of the logical stream named by `Kind`
//! and the task ids; it is not a transport EOF.

use std::fmt;

use crate::error::ProtocolError;

/// Encoded header size in bytes
pub const HEADER_LEN: usize = 10;

/// Largest payload a single frame may carry
///
/// Senders chunk anything larger.
pub const MAX_PAYLOAD_LEN: usize = 1024;

/// Logical stream a frame belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Launcher stdin for a single task
    Stdin,
    /// Task stdout
    Stdout,
    /// Task stderr
    Stderr,
    /// Launcher stdin broadcast to every task
    AllStdin,
    /// Zero-payload liveness probe
    ConnectionTest,
}

impl FrameKind {
    /// Wire value
    #[must_use]
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
            Self::AllStdin => 3,
            Self::ConnectionTest => 4,
        }
    }

    /// Parse a wire value
    pub fn from_u16(value: u16) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Stdin),
            1 => Ok(Self::Stdout),
            2 => Ok(Self::Stderr),
            3 => Ok(Self::AllStdin),
            4 => Ok(Self::ConnectionTest),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::AllStdin => "all-stdin",
            Self::ConnectionTest => "connection-test",
        };
        f.write_str(name)
    }
}

/// Decoded frame header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// Stream kind
    pub kind: FrameKind,
    /// Step-wide task id
    pub global_task_id: u16,
    /// Task id within its node
    pub local_task_id: u16,
    /// Payload length; zero marks end of stream
    pub length: u32,
}

impl FrameHeader {
    /// Header with no task addressing and no payload
    #[must_use]
    pub fn control(kind: FrameKind) -> Self {
        Self {
            kind,
            global_task_id: 0,
            local_task_id: 0,
            length: 0,
        }
    }

    /// True for end-of-stream markers
    #[must_use]
    pub fn is_end_marker(&self) -> bool {
        self.length == 0 && self.kind != FrameKind::ConnectionTest
    }

    /// Payload length as usize
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.length as usize
    }

    /// Encode to wire bytes
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        self.encode_into(&mut out);
        out
    }

    /// Encode into the first `HEADER_LEN` bytes of `out`
    ///
    /// # Panics
    ///
    /// Panics if `out` is shorter than `HEADER_LEN`.
    pub fn encode_into(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.kind.as_u16().to_be_bytes());
        out[2..4].copy_from_slice(&self.global_task_id.to_be_bytes());
        out[4..6].copy_from_slice(&self.local_task_id.to_be_bytes());
        out[6..10].copy_from_slice(&self.length.to_be_bytes());
    }

    /// Decode wire bytes
    ///
    /// Never blocks; gathering the bytes off a socket is the caller's job.
    ///
    /// # Errors
    ///
    /// `ProtocolError::UnknownKind` for a kind outside the enumerated set,
    /// `ProtocolError::Oversized` for a length above `MAX_PAYLOAD_LEN`.
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        let kind = FrameKind::from_u16(u16::from_be_bytes([bytes[0], bytes[1]]))?;
        let global_task_id = u16::from_be_bytes([bytes[2], bytes[3]]);
        let local_task_id = u16::from_be_bytes([bytes[4], bytes[5]]);
        let length = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);

        if length as usize > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::Oversized {
                length,
                max: MAX_PAYLOAD_LEN,
            });
        }

        Ok(Self {
            kind,
            global_task_id,
            local_task_id,
            length,
        })
    }
}
