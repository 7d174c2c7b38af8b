//! Node Handshake
//!
//! Sent once by each node's execution agent right after it connects, before
//! any frame traffic.
//!
//! ```text
//! +-----------+-------------+------------+-----------+---------+-------------+-------------+
//! | Len (4)   | Version (2) | NodeId (4) | SigLen (4)| Sig     | Stdout (4)  | Stderr (4)  |
//! | u32 BE    | u16 BE      | u32 BE     | u32 BE    | SigLen  | u32 BE      | u32 BE      |
//! +-----------+-------------+------------+-----------+---------+-------------+-------------+
//! ```
//!
//! `Len` counts the bytes after itself.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{HandshakeError, ProtocolError, ValidationError};

/// Protocol revision spoken by this engine
pub const IO_PROTOCOL_VERSION: u16 = 0xb001;

/// Largest handshake body accepted
///
/// Checked before allocating so a hostile length prefix cannot exhaust memory.
pub const MAX_HANDSHAKE_LEN: usize = 8 * 1024;

/// Fixed part of the body: version + node id + sig len + two stream counts
const FIXED_BODY_LEN: usize = 2 + 4 + 4 + 4 + 4;

/// Handshake message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol revision
    pub version: u16,
    /// Node index within the step
    pub node_id: u32,
    /// Job credential signature
    pub signature: Vec<u8>,
    /// Stdout streams the node will send (one per local task it forwards)
    pub stdout_streams: u32,
    /// Stderr streams the node will send
    pub stderr_streams: u32,
}

impl Handshake {
    /// Handshake for the current protocol version
    #[must_use]
    pub fn new(node_id: u32, signature: Vec<u8>, stdout_streams: u32, stderr_streams: u32) -> Self {
        Self {
            version: IO_PROTOCOL_VERSION,
            node_id,
            signature,
            stdout_streams,
            stderr_streams,
        }
    }

    /// Encode including the length prefix
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let body_len = FIXED_BODY_LEN + self.signature.len();
        let mut buf = Vec::with_capacity(4 + body_len);
        buf.extend_from_slice(&(body_len as u32).to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.node_id.to_be_bytes());
        buf.extend_from_slice(&(self.signature.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.signature);
        buf.extend_from_slice(&self.stdout_streams.to_be_bytes());
        buf.extend_from_slice(&self.stderr_streams.to_be_bytes());
        buf
    }

    /// Parse a body (the bytes after the length prefix) without validating it
    pub fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor { data: body, pos: 0 };

        let version = cursor.u16()?;
        let node_id = cursor.u32()?;
        let sig_len = cursor.u32()? as usize;
        let signature = cursor.bytes(sig_len)?.to_vec();
        let stdout_streams = cursor.u32()?;
        let stderr_streams = cursor.u32()?;

        let trailing = cursor.remaining();
        if trailing != 0 {
            return Err(ProtocolError::TrailingBytes(trailing));
        }

        Ok(Self {
            version,
            node_id,
            signature,
            stdout_streams,
            stderr_streams,
        })
    }

    /// Check the handshake against the step's credential and size
    pub fn validate(&self, signature: &[u8], node_count: u32) -> Result<(), ValidationError> {
        if self.version != IO_PROTOCOL_VERSION {
            return Err(ValidationError::VersionMismatch {
                expected: IO_PROTOCOL_VERSION,
                found: self.version,
            });
        }
        if self.node_id >= node_count {
            return Err(ValidationError::NodeOutOfRange {
                node_id: self.node_id,
                node_count,
            });
        }
        if self.signature != signature {
            return Err(ValidationError::SignatureMismatch {
                node_id: self.node_id,
            });
        }
        Ok(())
    }

    /// Parse and validate a body
    pub fn decode(body: &[u8], signature: &[u8], node_count: u32) -> Result<Self, HandshakeError> {
        let handshake = Self::decode_body(body)?;
        handshake.validate(signature, node_count)?;
        Ok(handshake)
    }
}

/// Read one length-prefixed handshake off a socket
///
/// The result is parsed but not validated. The caller bounds the wait with a
/// timeout.
pub async fn read_handshake<R>(reader: &mut R) -> Result<Handshake, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let length = reader.read_u32().await?;
    if length as usize > MAX_HANDSHAKE_LEN {
        return Err(ProtocolError::HandshakeTooLarge {
            length,
            max: MAX_HANDSHAKE_LEN,
        }
        .into());
    }

    let mut body = vec![0u8; length as usize];
    reader.read_exact(&mut body).await?;
    Ok(Handshake::decode_body(&body)?)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let available = self.remaining();
        if n > available {
            return Err(ProtocolError::Truncated {
                needed: n,
                available,
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}
