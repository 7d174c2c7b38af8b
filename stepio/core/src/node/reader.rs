//! Read-Side State Machine
//!
//! Turns the byte stream from one node socket into routed frames. The
//! machine never touches the socket: the driver asks for `read_target()`,
//! reads into it, and reports the count to `advance()`.
//!
//! ```text
//!            ┌──────────────── ConnectionTest / end marker ───────────────┐
//!            ▼                                                            │
//!   AwaitingHeader ── 10 bytes ──► decode ── length > 0 ──► AwaitingPayload
//!            ▲                                                  │
//!            └──────────── Payload(buffer) routed ◄── length bytes
//! ```
//!
//! A buffer must be supplied (`give_buffer`) before header bytes are read so
//! that a full payload can always land somewhere; an exhausted pool therefore
//! suspends the whole read side instead of accepting bytes it cannot store.

use crate::buffer::Buffer;
use crate::error::ProtocolError;
use crate::protocol::{FrameHeader, FrameKind, HEADER_LEN};

/// Where the next socket bytes go
#[derive(Debug)]
pub(crate) enum ReadPhase {
    /// Collecting a 10-byte header
    AwaitingHeader {
        bytes: [u8; HEADER_LEN],
        filled: usize,
    },
    /// Collecting `header.length` payload bytes into the held buffer
    AwaitingPayload { header: FrameHeader, filled: usize },
}

/// Outcome of one `advance`
#[derive(Debug)]
pub(crate) enum ReadStep {
    /// Frame not complete yet
    Pending,
    /// Connection test probe, dropped
    Probe,
    /// Zero-length frame closing one logical stream
    EndOfStream(FrameHeader),
    /// Completed stdout/stderr frame ready for routing
    Payload(Buffer),
}

#[derive(Debug)]
pub(crate) struct FrameReader {
    phase: ReadPhase,
    buffer: Option<Buffer>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            phase: ReadPhase::AwaitingHeader {
                bytes: [0; HEADER_LEN],
                filled: 0,
            },
            buffer: None,
        }
    }

    /// A buffer must be supplied before reading
    pub fn needs_buffer(&self) -> bool {
        self.buffer.is_none()
    }

    pub fn give_buffer(&mut self, buffer: Buffer) {
        debug_assert!(self.buffer.is_none());
        self.buffer = Some(buffer);
    }

    /// Hand back the held buffer (partial frame or spare) for release
    pub fn take_buffer(&mut self) -> Option<Buffer> {
        self.phase = ReadPhase::AwaitingHeader {
            bytes: [0; HEADER_LEN],
            filled: 0,
        };
        self.buffer.take()
    }

    /// No partial frame in progress
    pub fn at_frame_boundary(&self) -> bool {
        matches!(self.phase, ReadPhase::AwaitingHeader { filled: 0, .. })
    }

    /// Slice the next read should fill
    ///
    /// Never longer than what the current frame still needs, so bytes of the
    /// following frame are left in the socket.
    pub fn read_target(&mut self) -> &mut [u8] {
        match &mut self.phase {
            ReadPhase::AwaitingHeader { bytes, filled } => &mut bytes[*filled..],
            ReadPhase::AwaitingPayload { header, filled } => match self.buffer.as_mut() {
                Some(buffer) => &mut buffer.payload_area_mut()[*filled..header.payload_len()],
                None => &mut [],
            },
        }
    }

    /// Account for `n` bytes just read into `read_target()`
    pub fn advance(&mut self, n: usize) -> Result<ReadStep, ProtocolError> {
        match &mut self.phase {
            ReadPhase::AwaitingHeader { bytes, filled } => {
                *filled += n;
                if *filled < HEADER_LEN {
                    return Ok(ReadStep::Pending);
                }

                let header = FrameHeader::decode(bytes);
                self.phase = ReadPhase::AwaitingHeader {
                    bytes: [0; HEADER_LEN],
                    filled: 0,
                };
                let header = header?;

                match header.kind {
                    FrameKind::ConnectionTest => Ok(ReadStep::Probe),
                    FrameKind::Stdin | FrameKind::AllStdin => {
                        Err(ProtocolError::UnexpectedKind(header.kind))
                    }
                    FrameKind::Stdout | FrameKind::Stderr if header.length == 0 => {
                        Ok(ReadStep::EndOfStream(header))
                    }
                    FrameKind::Stdout | FrameKind::Stderr => {
                        self.phase = ReadPhase::AwaitingPayload { header, filled: 0 };
                        Ok(ReadStep::Pending)
                    }
                }
            }
            ReadPhase::AwaitingPayload { header, filled } => {
                *filled += n;
                if *filled < header.payload_len() {
                    return Ok(ReadStep::Pending);
                }

                let header = *header;
                self.phase = ReadPhase::AwaitingHeader {
                    bytes: [0; HEADER_LEN],
                    filled: 0,
                };
                match self.buffer.take() {
                    Some(mut buffer) => {
                        buffer.seal(header);
                        Ok(ReadStep::Payload(buffer))
                    }
                    None => Ok(ReadStep::Pending),
                }
            }
        }
    }
}

/// Stdout/stderr streams a node still has open
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RemoteStreams {
    pub stdout: u32,
    pub stderr: u32,
}

impl RemoteStreams {
    pub fn new(stdout: u32, stderr: u32) -> Self {
        Self { stdout, stderr }
    }

    /// Count down one stream; `true` once none are left
    pub fn close(&mut self, kind: FrameKind) -> bool {
        let counter = match kind {
            FrameKind::Stdout => &mut self.stdout,
            FrameKind::Stderr => &mut self.stderr,
            _ => return self.all_closed(),
        };
        if *counter == 0 {
            tracing::warn!(%kind, "End marker for a stream that was never open");
        } else {
            *counter -= 1;
        }
        self.all_closed()
    }

    pub fn force_closed(&mut self) {
        self.stdout = 0;
        self.stderr = 0;
    }

    pub fn all_closed(&self) -> bool {
        self.stdout == 0 && self.stderr == 0
    }
}
