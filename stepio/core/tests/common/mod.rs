//! Shared fixtures for the stepio integration tests

#![allow(dead_code)]

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::AsyncWrite;

use stepio_core::sim::SimNode;
use stepio_core::{
    BlockLayout, Collaborators, Controller, IoConfig, LocalIo, StaticCredential, StepParams,
};

/// Signature every test step uses
pub const SIGNATURE: &[u8] = b"test-job-credential";

/// Upper bound for any wait in these tests
pub const WAIT: Duration = Duration::from_secs(10);

/// Route engine logs through the test harness; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("stepio_core=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Loopback config with small pools and a short handshake timeout
pub fn loopback_config() -> IoConfig {
    IoConfig {
        bind_addr: IpAddr::from([127, 0, 0, 1]),
        prewarm_buffers: 4,
        handshake_timeout_ms: 300,
        drain_timeout_ms: 2_000,
        ..Default::default()
    }
}

/// In-memory sink the test can read after `finish`
#[derive(Clone, Default)]
pub struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl SharedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    /// Output lines, sorted so cross-node interleaving does not matter
    pub fn sorted_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.text().lines().map(str::to_string).collect();
        lines.sort();
        lines
    }

    pub fn boxed(&self) -> Box<dyn AsyncWrite + Send + Unpin> {
        Box::new(self.clone())
    }
}

impl AsyncWrite for SharedOutput {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.0.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Failure reports collected from the engine
#[derive(Clone, Default)]
pub struct FailureLog(Arc<Mutex<Vec<(u32, String)>>>);

impl FailureLog {
    pub fn entries(&self) -> Vec<(u32, String)> {
        self.0.lock().clone()
    }
}

/// Collaborators for a uniform step, failures recorded in the returned log
pub fn collaborators(nodes: u32, tasks_per_node: u32) -> (Collaborators, FailureLog) {
    let log = FailureLog::default();
    let sink = Arc::clone(&log.0);
    let collab = Collaborators::new(
        StaticCredential(SIGNATURE.to_vec()),
        BlockLayout::uniform(nodes, tasks_per_node),
    )
    .with_failure_handler(move |node_id: u32, hostname: &str| {
        sink.lock().push((node_id, hostname.to_string()));
    });
    (collab, log)
}

/// A started controller for `nodes` x `tasks_per_node`
pub fn start_step(
    nodes: u32,
    tasks_per_node: u32,
    label: bool,
    local: LocalIo,
    config: IoConfig,
) -> (Controller, FailureLog) {
    let (collab, log) = collaborators(nodes, tasks_per_node);
    let params = StepParams::new(nodes * tasks_per_node, nodes).with_label(label);
    let mut io = Controller::create(params, local, collab, config).unwrap();
    io.start().unwrap();
    (io, log)
}

/// Address of the listener a node should use
pub fn node_addr(io: &Controller, node_id: u32) -> SocketAddr {
    let ports = io.listen_ports();
    SocketAddr::from(([127, 0, 0, 1], ports[node_id as usize % ports.len()]))
}

/// Connect a simulated node hosting `tasks` tasks
pub fn connect_node(io: &Controller, node_id: u32, tasks: u32) -> SimNode {
    let node = SimNode::connect(node_addr(io, node_id), node_id, SIGNATURE, tasks, tasks).unwrap();
    node.set_read_timeout(Some(WAIT)).unwrap();
    node
}

/// Poll `check` until it holds or `WAIT` runs out
pub fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

/// End every stdout and stderr stream of the given tasks
pub fn close_streams(node: &mut SimNode, tasks: std::ops::Range<u16>) {
    for task in tasks {
        node.close_stdout(task).unwrap();
        node.close_stderr(task).unwrap();
    }
}
