//! Stdin Reader
//!
//! Reads the launcher's stdin and queues it to the destination nodes:
//!
//! 1. Wait until every destination node is ready (connected or down).
//! 2. Size the next chunk to the smallest free space among live
//!    destinations, capped at `MAX_PAYLOAD_LEN`. Zero means wait for a
//!    queue to drain.
//! 3. Read, seal as `AllStdin` (broadcast) or `Stdin` (one task), and share
//!    the buffer among the live destinations.
//! 4. On EOF send one zero-length end marker to every live destination.

use std::rc::Rc;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;

use super::StdinTarget;
use crate::buffer::Buffer;
use crate::node::NodeRegistry;
use crate::protocol::{FrameHeader, FrameKind, MAX_PAYLOAD_LEN};
use crate::shared::Shared;

/// A stdin source after `create` opened it; still `Send`
pub(crate) enum StdinInput {
    Terminal,
    File(std::fs::File),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl StdinInput {
    /// Must run inside the event-loop runtime
    fn into_async(self) -> Box<dyn AsyncRead + Unpin> {
        match self {
            Self::Terminal => Box::new(tokio::io::stdin()),
            Self::File(file) => Box::new(tokio::fs::File::from_std(file)),
            Self::Reader(reader) => reader,
        }
    }
}

/// Largest chunk every destination can take
pub(crate) fn chunk_len(free_space: impl IntoIterator<Item = usize>) -> usize {
    free_space.into_iter().fold(MAX_PAYLOAD_LEN, usize::min)
}

pub(crate) struct StdinBridge {
    shared: Arc<Shared>,
    nodes: Rc<NodeRegistry>,
    target: StdinTarget,
    destinations: Vec<u32>,
    stop: Rc<Notify>,
}

impl StdinBridge {
    pub fn new(
        shared: Arc<Shared>,
        nodes: Rc<NodeRegistry>,
        target: StdinTarget,
        destinations: Vec<u32>,
        stop: Rc<Notify>,
    ) -> Self {
        Self {
            shared,
            nodes,
            target,
            destinations,
            stop,
        }
    }

    pub async fn run(self, input: StdinInput) {
        let mut source = input.into_async();

        if !self.wait_for_destinations().await {
            return;
        }
        tracing::debug!(destinations = self.destinations.len(), "Stdin forwarding active");

        let mut forwarded: u64 = 0;
        loop {
            let live = self.nodes.accepting_stdin(&self.destinations);
            if live.is_empty() {
                tracing::debug!(bytes = forwarded, "No live stdin destinations left");
                return;
            }

            let chunk = chunk_len(live.iter().map(|node| node.free_space()));
            if chunk == 0 {
                if !self.wait_for_space().await {
                    return;
                }
                continue;
            }

            let Some(mut buffer) = self.acquire().await else {
                return;
            };
            let read = tokio::select! {
                result = source.read(&mut buffer.payload_area_mut()[..chunk]) => Some(result),
                () = self.stop.notified() => None,
            };

            let n = match read {
                None => {
                    self.shared.release_outgoing_exclusive(buffer);
                    return;
                }
                Some(Ok(n)) => n,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Stdin read failed; treating as EOF");
                    0
                }
            };

            if n == 0 {
                self.shared.release_outgoing_exclusive(buffer);
                self.send_end_marker().await;
                tracing::debug!(bytes = forwarded, "Stdin reached EOF");
                return;
            }

            forwarded += n as u64;
            self.dispatch(buffer, n);
        }
    }

    /// `false` if stopped while waiting
    async fn wait_for_destinations(&self) -> bool {
        loop {
            let notified = self.shared.nodes_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = {
                let state = self.shared.lock();
                self.destinations.iter().all(|&id| state.ready.contains(id))
            };
            if ready {
                return true;
            }

            tokio::select! {
                () = notified => {}
                () = self.stop.notified() => return false,
            }
        }
    }

    /// `false` if stopped while waiting
    async fn wait_for_space(&self) -> bool {
        let drained = self.shared.outbound_drained.notified();
        let changed = self.shared.nodes_changed.notified();
        tokio::pin!(drained, changed);
        drained.as_mut().enable();
        changed.as_mut().enable();

        let live = self.nodes.accepting_stdin(&self.destinations);
        if chunk_len(live.iter().map(|node| node.free_space())) > 0 {
            return true;
        }

        tokio::select! {
            () = drained => true,
            () = changed => true,
            () = self.stop.notified() => false,
        }
    }

    async fn acquire(&self) -> Option<Buffer> {
        tokio::select! {
            buffer = self.shared.acquire_outgoing() => Some(buffer),
            () = self.stop.notified() => None,
        }
    }

    fn header(&self, length: usize) -> FrameHeader {
        let (kind, task) = match self.target {
            StdinTarget::Broadcast => (FrameKind::AllStdin, 0),
            StdinTarget::Task(task) => (FrameKind::Stdin, task),
        };
        FrameHeader {
            kind,
            global_task_id: u16::try_from(task).unwrap_or(u16::MAX),
            local_task_id: 0,
            length: u32::try_from(length).unwrap_or(u32::MAX),
        }
    }

    /// Seal a filled buffer and queue it to every live destination
    fn dispatch(&self, mut buffer: Buffer, length: usize) {
        buffer.seal(self.header(length));
        let live = self.nodes.accepting_stdin(&self.destinations);
        let shares = self.shared.share_outgoing(buffer, live.len());
        for (node, share) in live.iter().zip(shares) {
            if let Err(share) = node.enqueue(share) {
                self.shared.release_outgoing(share);
            }
        }
    }

    async fn send_end_marker(&self) {
        if self.nodes.accepting_stdin(&self.destinations).is_empty() {
            return;
        }
        if let Some(buffer) = self.acquire().await {
            self.dispatch(buffer, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::buffer::SharedBuffer;
    use crate::config::IoConfig;
    use crate::node::reader::RemoteStreams;
    use crate::node::NodeHandle;
    use pretty_assertions::assert_eq;

    const QUEUE_BYTES: usize = 300;

    /// Two ready destinations, each with a `QUEUE_BYTES` outbound queue
    fn two_nodes() -> (Arc<Shared>, Rc<NodeRegistry>) {
        let config = IoConfig {
            outbound_queue_bytes: QUEUE_BYTES,
            ..Default::default()
        };
        let shared = Arc::new(Shared::new(&config, 2));
        let nodes = Rc::new(NodeRegistry::new(2));
        for node_id in 0..2 {
            let handle = NodeHandle::new(node_id, RemoteStreams::new(1, 1), QUEUE_BYTES);
            assert!(nodes.insert(Rc::new(handle)));
        }
        shared.update_nodes(|state| {
            state.ready.insert(0);
            state.ready.insert(1);
        });
        (shared, nodes)
    }

    fn queued_lengths(nodes: &NodeRegistry, node_id: u32) -> Vec<usize> {
        nodes
            .get(node_id)
            .unwrap()
            .drain_queue()
            .iter()
            .map(|buffer| SharedBuffer::header(buffer).payload_len())
            .collect()
    }

    #[tokio::test]
    async fn test_chunk_shrinks_to_fullest_destination() {
        let (shared, nodes) = two_nodes();

        // Node 1 already holds 260 of its 300 bytes; node 0 is empty
        let mut backlog = shared.try_acquire_outgoing().unwrap();
        backlog.seal(FrameHeader {
            length: 260,
            ..FrameHeader::control(FrameKind::AllStdin)
        });
        for share in shared.share_outgoing(backlog, 1) {
            assert!(nodes.get(1).unwrap().enqueue(share).is_ok());
        }

        let bridge = StdinBridge::new(
            Arc::clone(&shared),
            Rc::clone(&nodes),
            StdinTarget::Broadcast,
            vec![0, 1],
            Rc::new(Notify::new()),
        );
        let input = StdinInput::Reader(Box::new(std::io::Cursor::new(vec![b'x'; 100])));

        // Nothing drains the queues, so the bridge parks once node 1 is full
        let run = tokio::time::timeout(Duration::from_millis(50), bridge.run(input)).await;
        assert!(run.is_err(), "bridge finished instead of waiting for queue space");

        assert_eq!(nodes.get(1).unwrap().free_space(), 0);
        assert_eq!(nodes.get(0).unwrap().free_space(), QUEUE_BYTES - 40);
        assert_eq!(queued_lengths(&nodes, 0), vec![40]);
        assert_eq!(queued_lengths(&nodes, 1), vec![260, 40]);
    }

    #[tokio::test]
    async fn test_single_task_stdin_and_end_marker() {
        let (shared, nodes) = two_nodes();
        let bridge = StdinBridge::new(
            Arc::clone(&shared),
            Rc::clone(&nodes),
            StdinTarget::Task(3),
            vec![1],
            Rc::new(Notify::new()),
        );
        let input = StdinInput::Reader(Box::new(std::io::Cursor::new(b"abc".to_vec())));
        bridge.run(input).await;

        let frames: Vec<FrameHeader> = nodes
            .get(1)
            .unwrap()
            .drain_queue()
            .iter()
            .map(SharedBuffer::header)
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!((frames[0].kind, frames[0].global_task_id, frames[0].length), (FrameKind::Stdin, 3, 3));
        assert!(frames[1].is_end_marker());
        assert!(queued_lengths(&nodes, 0).is_empty());
    }

    #[test]
    fn test_chunk_len_takes_tightest_queue() {
        assert_eq!(chunk_len([4096, 4096]), MAX_PAYLOAD_LEN);
        assert_eq!(chunk_len([4096, 40, 900]), 40);
        assert_eq!(chunk_len([0, 4096]), 0);
        assert_eq!(chunk_len(std::iter::empty()), MAX_PAYLOAD_LEN);
    }
}
