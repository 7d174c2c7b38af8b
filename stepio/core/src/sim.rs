//! Node Simulator
//!
//! A blocking client that plays the node-agent side of the protocol: it
//! connects, sends a handshake, writes stdout/stderr frames and reads stdin
//! frames. Used by the `stepio-loopback` binary and the integration tests.
//!
//! ```no_run
//! use stepio_core::sim::SimNode;
//!
//! let mut node = SimNode::connect("127.0.0.1:6000".parse()?, 0, b"sig", 1, 1)?;
//! node.send_stdout(0, b"hello\n")?;
//! node.close_stdout(0)?;
//! node.close_stderr(0)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use crate::protocol::{FrameHeader, FrameKind, Handshake, HEADER_LEN, MAX_PAYLOAD_LEN};

/// One simulated node agent
#[derive(Debug)]
pub struct SimNode {
    stream: TcpStream,
    node_id: u32,
}

impl SimNode {
    /// Connect and send a handshake with the current protocol version
    pub fn connect(
        addr: SocketAddr,
        node_id: u32,
        signature: &[u8],
        stdout_streams: u32,
        stderr_streams: u32,
    ) -> io::Result<Self> {
        let handshake = Handshake::new(node_id, signature.to_vec(), stdout_streams, stderr_streams);
        Self::connect_with(addr, &handshake)
    }

    /// Connect and send an arbitrary handshake
    pub fn connect_with(addr: SocketAddr, handshake: &Handshake) -> io::Result<Self> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.write_all(&handshake.encode())?;
        Ok(Self {
            stream,
            node_id: handshake.node_id,
        })
    }

    /// Node id this simulator claimed
    #[must_use]
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Write one frame
    pub fn send_frame(&mut self, header: FrameHeader, payload: &[u8]) -> io::Result<()> {
        let mut wire = Vec::with_capacity(HEADER_LEN + payload.len());
        wire.extend_from_slice(&header.encode());
        wire.extend_from_slice(payload);
        self.stream.write_all(&wire)
    }

    /// Write task output as stdout frames of at most `MAX_PAYLOAD_LEN`
    pub fn send_stdout(&mut self, task: u16, data: &[u8]) -> io::Result<()> {
        self.send_output(FrameKind::Stdout, task, data)
    }

    /// Write task output as stderr frames of at most `MAX_PAYLOAD_LEN`
    pub fn send_stderr(&mut self, task: u16, data: &[u8]) -> io::Result<()> {
        self.send_output(FrameKind::Stderr, task, data)
    }

    fn send_output(&mut self, kind: FrameKind, task: u16, data: &[u8]) -> io::Result<()> {
        for chunk in data.chunks(MAX_PAYLOAD_LEN) {
            let header = FrameHeader {
                kind,
                global_task_id: task,
                local_task_id: 0,
                length: chunk.len() as u32,
            };
            self.send_frame(header, chunk)?;
        }
        Ok(())
    }

    /// End one stdout stream
    pub fn close_stdout(&mut self, task: u16) -> io::Result<()> {
        self.send_end_marker(FrameKind::Stdout, task)
    }

    /// End one stderr stream
    pub fn close_stderr(&mut self, task: u16) -> io::Result<()> {
        self.send_end_marker(FrameKind::Stderr, task)
    }

    fn send_end_marker(&mut self, kind: FrameKind, task: u16) -> io::Result<()> {
        let header = FrameHeader {
            global_task_id: task,
            ..FrameHeader::control(kind)
        };
        self.send_frame(header, &[])
    }

    /// Probe the launcher side
    pub fn send_connection_test(&mut self) -> io::Result<()> {
        self.send_frame(FrameHeader::control(FrameKind::ConnectionTest), &[])
    }

    /// Write bytes with no framing
    pub fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }

    /// Bound how long `read_frame` blocks
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Next frame from the launcher; `None` once the launcher closed the socket
    pub fn read_frame(&mut self) -> io::Result<Option<(FrameHeader, Vec<u8>)>> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            match self.stream.read(&mut header[filled..])? {
                0 if filled == 0 => return Ok(None),
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => filled += n,
            }
        }

        let header = FrameHeader::decode(&header)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut payload = vec![0u8; header.payload_len()];
        self.stream.read_exact(&mut payload)?;
        Ok(Some((header, payload)))
    }

    /// Read frames until the launcher closes the socket
    pub fn read_until_closed(&mut self) -> io::Result<Vec<(FrameHeader, Vec<u8>)>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.read_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Close both directions without further frames
    pub fn disconnect(self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Both)
    }
}
