//! stepio Loopback
//!
//! Runs a step I/O controller against simulated node agents on localhost.
//! Every simulated task echoes the launcher's stdin back as its stdout, so
//! piping text in shows the full path: stdin -> AllStdin frames -> nodes ->
//! stdout frames -> labelled launcher output.
//!
//! # Usage
//!
//! ```bash
//! # Four nodes, two tasks each, labelled output
//! echo hello | stepio-loopback --nodes 4 --tasks-per-node 2 --label
//!
//! # No stdin: each task greets once
//! stepio-loopback --nodes 2 --greet
//!
//! # Per-task output files
//! echo hi | stepio-loopback --output 'out-%2t.txt'
//!
//! # With verbose logging
//! RUST_LOG=stepio_core=debug stepio-loopback --greet
//! ```
//!
//! # Environment Variables
//!
//! - `STEPIO_*`: engine tunables, see `IoConfig`
//! - `RUST_LOG`: log level (trace, debug, info, warn, error)

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use stepio_core::sim::SimNode;
use stepio_core::{
    BlockLayout, Collaborators, Controller, FrameKind, IoConfig, LocalIo, OutputTarget,
    StaticCredential, StdinSource, StdinTarget, StepParams,
};

/// Loopback harness for the step I/O engine
#[derive(Debug, Parser)]
#[command(name = "stepio-loopback", version)]
struct Args {
    /// Simulated nodes
    #[arg(long, default_value_t = 4)]
    nodes: u32,

    /// Tasks on each node
    #[arg(long, default_value_t = 2)]
    tasks_per_node: u32,

    /// Prefix output lines with task ids
    #[arg(long)]
    label: bool,

    /// Tasks print a greeting instead of echoing stdin
    #[arg(long)]
    greet: bool,

    /// Read stdin from this file instead of the terminal
    #[arg(long)]
    input: Option<PathBuf>,

    /// Output file pattern (%t %n %N %j %s); terminal when unset
    #[arg(long)]
    output: Option<String>,

    /// Engine config file; default location when unset
    #[arg(long, env = "STEPIO_CONFIG")]
    config: Option<PathBuf>,

    /// Give up waiting for the step after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stepio_loopback=info".parse()?)
                .add_directive("stepio_core=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => IoConfig::load_from_path(path)?,
        None => IoConfig::load()?,
    };
    config.bind_addr = IpAddr::from([127, 0, 0, 1]);

    let layout = BlockLayout::uniform(args.nodes, args.tasks_per_node);
    let params = StepParams::new(args.nodes * args.tasks_per_node, args.nodes).with_label(args.label);
    let signature = format!("loopback-{}", std::process::id()).into_bytes();

    let stdin = match (&args.input, args.greet) {
        (_, true) => StdinSource::NotHandled,
        (Some(path), false) => StdinSource::File(path.clone()),
        (None, false) => StdinSource::Terminal,
    };
    let stdout = match &args.output {
        Some(pattern) => OutputTarget::File(pattern.clone()),
        None => OutputTarget::Terminal,
    };
    let local = LocalIo::default()
        .with_stdin(stdin, StdinTarget::Broadcast)
        .with_stdout(stdout)
        .with_stderr(OutputTarget::SameAsStdout);

    let collab = Collaborators::new(StaticCredential(signature.clone()), layout.clone())
        .with_failure_handler(|node_id: u32, hostname: &str| {
            warn!(node_id, hostname, "Simulated node failed");
        });

    let mut io = Controller::create(params, local, collab, config).context("creating step I/O")?;
    io.start().context("starting event loop")?;

    let ports = io.listen_ports().to_vec();
    info!(nodes = args.nodes, ports = ?ports, "Launching simulated nodes");

    let agents: Vec<_> = (0..args.nodes)
        .map(|node_id| {
            let port = ports[node_id as usize % ports.len()];
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            let tasks: Vec<u16> = layout
                .tasks_on(node_id)
                .filter_map(|task| u16::try_from(task).ok())
                .collect();
            let signature = signature.clone();
            let greet = args.greet;
            thread::spawn(move || run_node(addr, node_id, &signature, &tasks, greet))
        })
        .collect();

    if !io.wait_for_completion(Duration::from_secs(args.timeout_secs)) {
        warn!("Step did not finish in time; aborting");
        io.abort();
    }
    for agent in agents {
        match agent.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Simulated node exited with error"),
            Err(_) => warn!("Simulated node thread panicked"),
        }
    }

    let stats = io.stats();
    io.finish()?;
    io.destroy()?;
    info!(
        connected = stats.connected,
        finished = stats.finished,
        "Loopback complete"
    );
    Ok(())
}

/// One simulated node agent: echo stdin frames, or greet, then end streams
fn run_node(
    addr: SocketAddr,
    node_id: u32,
    signature: &[u8],
    tasks: &[u16],
    greet: bool,
) -> anyhow::Result<()> {
    let streams = u32::try_from(tasks.len())?;
    let mut node = SimNode::connect(addr, node_id, signature, streams, streams)
        .with_context(|| format!("node {node_id} connecting to {addr}"))?;

    if greet {
        for &task in tasks {
            node.send_stdout(task, format!("hello from task {task} on node {node_id}\n").as_bytes())?;
        }
    } else {
        while let Some((header, payload)) = node.read_frame()? {
            match header.kind {
                FrameKind::AllStdin | FrameKind::Stdin if header.is_end_marker() => break,
                FrameKind::AllStdin | FrameKind::Stdin => {
                    for &task in tasks {
                        node.send_stdout(task, &payload)?;
                    }
                }
                _ => {}
            }
        }
    }

    for &task in tasks {
        node.close_stdout(task)?;
        node.close_stderr(task)?;
    }
    Ok(())
}
