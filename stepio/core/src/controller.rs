//! Controller
//!
//! One `Controller` per job step. It owns the shared pools and node sets,
//! the listening sockets, and the event-loop thread.
//!
//! # Lifecycle
//!
//! ```text
//!   create ──► start ──► (mark_nodes_down | abort | send_connection_test)* ──► finish ──► destroy
//! ```
//!
//! Everything that can fail at setup (binding, opening files, building the
//! runtime) fails in `create`. `start` only spawns the thread; `finish`
//! shuts the loop down, drains the writers and joins.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use stepio_core::{
//!     BlockLayout, Collaborators, Controller, IoConfig, LocalIo, StaticCredential, StepParams,
//! };
//!
//! let collab = Collaborators::new(
//!     StaticCredential(b"job-credential".to_vec()),
//!     BlockLayout::uniform(4, 2),
//! );
//! let mut io = Controller::create(
//!     StepParams::new(8, 4).with_label(true),
//!     LocalIo::terminal(),
//!     collab,
//!     IoConfig::load()?,
//! )?;
//! io.start()?;
//! // hand io.listen_ports() to the node agents, launch the tasks...
//! io.wait_for_completion(Duration::from_secs(3600));
//! io.finish()?;
//! io.destroy()?;
//! # Ok::<(), stepio_core::StepIoError>(())
//! ```

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::LocalSet;

use crate::bridge::output::OutputPlan;
use crate::bridge::stdin::StdinInput;
use crate::bridge::{LocalIo, StdinSource, StdinTarget};
use crate::config::IoConfig;
use crate::error::StepIoError;
use crate::event_loop::{self, Command, LoopSetup};
use crate::listener::bind_listeners;
use crate::protocol::{FrameHeader, FrameKind};
use crate::shared::Shared;
use crate::step::{Collaborators, StepParams};

/// Signals the event-loop thread keeps blocked so they reach the launcher
const JOB_SIGNALS: [Signal; 9] = [
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGTSTP,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGALRM,
    Signal::SIGPIPE,
];

/// Usage of one buffer pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers allocated so far
    pub allocated: usize,
    /// Buffers on the free list
    pub free: usize,
    /// Allocation cap
    pub cap: usize,
}

/// Snapshot of engine state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoStats {
    /// Nodes whose handshake was accepted
    pub connected: u32,
    /// Nodes marked down
    pub down: u32,
    /// Nodes with no further I/O
    pub finished: u32,
    /// Node -> launcher pool
    pub incoming: PoolStats,
    /// Launcher -> node pool
    pub outgoing: PoolStats,
}

enum LoopState {
    Created {
        runtime: Runtime,
        setup: Box<LoopSetup>,
        commands: mpsc::UnboundedReceiver<Command>,
    },
    Running(JoinHandle<()>),
    Finished,
}

/// Stdio forwarding for one job step
pub struct Controller {
    params: StepParams,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    ports: Vec<u16>,
    state: LoopState,
}

impl Controller {
    /// Allocate pools, bind listeners, open local files, build the runtime
    pub fn create(
        params: StepParams,
        local: LocalIo,
        collab: Collaborators,
        config: IoConfig,
    ) -> Result<Self, StepIoError> {
        params.validate()?;
        config.validate()?;
        for (what, task) in [
            ("stdin target", match local.stdin_target {
                StdinTarget::Task(task) => Some(task),
                StdinTarget::Broadcast => None,
            }),
            ("output filter", local.output_filter),
        ] {
            if let Some(task) = task.filter(|&t| t >= params.task_count) {
                return Err(StepIoError::InvalidParams(format!(
                    "{what} task {task} is outside the step's {} tasks",
                    params.task_count
                )));
            }
        }

        let shared = Arc::new(Shared::new(&config, params.node_count));

        let listeners = bind_listeners(&config, params.node_count).map_err(StepIoError::Bind)?;
        let ports: Vec<u16> = listeners
            .iter()
            .filter_map(|listener| listener.local_addr().ok())
            .map(|addr| addr.port())
            .collect();

        let output = OutputPlan::build(
            local.stdout,
            local.stderr,
            local.output_filter,
            &params,
            collab.layout.as_ref(),
            config.open_mode,
        )?;

        let stdin = match local.stdin {
            StdinSource::NotHandled => None,
            StdinSource::Terminal => Some(StdinInput::Terminal),
            StdinSource::Reader(reader) => Some(StdinInput::Reader(reader)),
            StdinSource::File(path) => {
                let file = std::fs::File::open(&path)
                    .map_err(|source| StepIoError::OpenFile { path, source })?;
                Some(StdinInput::File(file))
            }
        }
        .map(|input| (input, local.stdin_target));

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(StepIoError::Runtime)?;
        let (tx, rx) = mpsc::unbounded_channel();

        tracing::info!(
            tasks = params.task_count,
            nodes = params.node_count,
            label = params.label,
            ports = ?ports,
            "Step I/O created"
        );

        let setup = LoopSetup {
            shared: Arc::clone(&shared),
            params: params.clone(),
            config,
            signature: collab.credential.signature(),
            collab,
            listeners,
            output,
            stdin,
        };

        Ok(Self {
            params,
            shared,
            commands: tx,
            ports,
            state: LoopState::Created {
                runtime,
                setup: Box::new(setup),
                commands: rx,
            },
        })
    }

    /// Spawn the event-loop thread
    ///
    /// Returns once the thread has blocked the job-termination signals.
    pub fn start(&mut self) -> Result<(), StepIoError> {
        let LoopState::Created { .. } = self.state else {
            return Err(StepIoError::AlreadyStarted);
        };
        let LoopState::Created {
            runtime,
            setup,
            commands,
        } = std::mem::replace(&mut self.state, LoopState::Finished)
        else {
            return Err(StepIoError::AlreadyStarted);
        };

        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);
        let thread = std::thread::Builder::new()
            .name("stepio-event-loop".to_string())
            .spawn(move || {
                block_job_signals();
                let _ = ready_tx.send(());

                let local = LocalSet::new();
                local.block_on(&runtime, event_loop::run(*setup, commands));
                runtime.shutdown_background();
            })
            .map_err(StepIoError::Spawn)?;

        if ready_rx.recv().is_err() {
            let _ = thread.join();
            return Err(StepIoError::LoopStartFailed);
        }
        self.state = LoopState::Running(thread);
        tracing::debug!("Event loop thread started");
        Ok(())
    }

    /// Shut the loop down, drain writers, join the thread
    ///
    /// Calling it again, or on a controller that never started, is a no-op.
    pub fn finish(&mut self) -> Result<(), StepIoError> {
        match std::mem::replace(&mut self.state, LoopState::Finished) {
            LoopState::Created { .. } | LoopState::Finished => Ok(()),
            LoopState::Running(thread) => {
                let _ = self.commands.send(Command::Shutdown);
                thread.join().map_err(|_| StepIoError::LoopPanicked)?;
                tracing::info!(stats = ?self.stats(), "Step I/O finished");
                Ok(())
            }
        }
    }

    /// Release the controller; only valid after `finish`
    pub fn destroy(self) -> Result<(), StepIoError> {
        if let LoopState::Running(_) = self.state {
            return Err(StepIoError::StillRunning);
        }
        let stats = self.stats();
        if stats.incoming.free != stats.incoming.allocated
            || stats.outgoing.free != stats.outgoing.allocated
        {
            tracing::debug!(?stats, "Destroyed with buffers still outstanding");
        }
        Ok(())
    }

    /// Stop waiting for these nodes and end their connections
    ///
    /// Nodes that never connected count as ready and finished from now on,
    /// and a late handshake from them is rejected. Connected nodes are shut
    /// down on the loop's next iteration without a failure report.
    pub fn mark_nodes_down(&self, node_ids: &[u32]) {
        let node_count = self.params.node_count;
        let live: Vec<u32> = self.shared.update_nodes(|state| {
            let mut live = Vec::new();
            for &node_id in node_ids {
                if node_id >= node_count {
                    tracing::warn!(node_id, node_count, "Ignoring down mark for unknown node");
                    continue;
                }
                state.down.insert(node_id);
                state.ready.insert(node_id);
                if state.connected.contains(node_id) {
                    live.push(node_id);
                } else {
                    state.finished.insert(node_id);
                }
            }
            live
        });

        tracing::info!(nodes = ?node_ids, connected = ?live, "Nodes marked down");
        if !live.is_empty() {
            let _ = self.commands.send(Command::NodesDown(live));
        }
    }

    /// Tear down every connection; the step is being killed
    pub fn abort(&self) {
        self.shared.update_nodes(|state| {
            state.shutting_down = true;
            for node_id in 0..self.params.node_count {
                if !state.connected.contains(node_id) {
                    state.down.insert(node_id);
                    state.ready.insert(node_id);
                    state.finished.insert(node_id);
                }
            }
        });
        tracing::info!("Step I/O aborted");
        let _ = self.commands.send(Command::Abort);
    }

    /// Queue a `ConnectionTest` frame to a quiet node
    ///
    /// `false` if the node is not connected, already finished, or the
    /// outgoing pool has no free buffer.
    pub fn send_connection_test(&self, node_id: u32) -> bool {
        {
            let state = self.shared.lock();
            if !state.connected.contains(node_id) || state.finished.contains(node_id) {
                return false;
            }
        }
        let Some(mut buffer) = self.shared.try_acquire_outgoing() else {
            tracing::debug!(node_id, "No outgoing buffer for connection test");
            return false;
        };
        buffer.seal(FrameHeader::control(FrameKind::ConnectionTest));

        match self.commands.send(Command::ConnectionTest { node_id, buffer }) {
            Ok(()) => true,
            Err(mpsc::error::SendError(command)) => {
                if let Command::ConnectionTest { buffer, .. } = command {
                    self.shared.release_outgoing_exclusive(buffer);
                }
                false
            }
        }
    }

    /// Ports the node agents should connect to
    #[must_use]
    pub fn listen_ports(&self) -> &[u16] {
        &self.ports
    }

    /// Step shape
    #[must_use]
    pub fn params(&self) -> &StepParams {
        &self.params
    }

    /// Block until every node is connected or marked down
    pub fn wait_for_connections(&self, timeout: Duration) -> bool {
        let ready = self.shared.wait_until(timeout, |state| state.ready.is_full());
        if !ready {
            let missing: Vec<u32> = self.shared.lock().ready.missing().collect();
            tracing::debug!(?missing, "Nodes not yet connected");
        }
        ready
    }

    /// Block until no node has I/O left
    pub fn wait_for_completion(&self, timeout: Duration) -> bool {
        self.shared.wait_until(timeout, |state| state.finished.is_full())
    }

    /// Current node and pool counters
    #[must_use]
    pub fn stats(&self) -> IoStats {
        let state = self.shared.lock();
        let pool = |pool: &crate::buffer::BufferPool| PoolStats {
            allocated: pool.allocated(),
            free: pool.free_count(),
            cap: pool.cap(),
        };
        IoStats {
            connected: state.connected.count(),
            down: state.down.count(),
            finished: state.finished.count(),
            incoming: pool(&state.incoming),
            outgoing: pool(&state.outgoing),
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let LoopState::Running(_) = self.state {
            tracing::warn!("Controller dropped while running; finishing");
            if let Err(e) = self.finish() {
                tracing::error!(error = %e, "Finish during drop failed");
            }
        }
    }
}

fn block_job_signals() {
    let mut set = SigSet::empty();
    for signal in JOB_SIGNALS {
        set.add(signal);
    }
    if let Err(e) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None) {
        tracing::warn!(error = %e, "Failed to block job signals on event loop thread");
    }
}
