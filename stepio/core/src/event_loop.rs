//! Event Loop
//!
//! Everything below runs on the single event-loop thread inside a
//! `LocalSet`. Node and bridge state lives in `Rc`/`RefCell` owned by tasks
//! on that set; the launcher thread reaches it only through [`Command`]s on
//! the wake channel and through the mutex-guarded [`Shared`] state.
//!
//! ```text
//!   launcher thread                       event-loop thread
//!   ───────────────                       ────────────────────────────────
//!   mark_nodes_down ─┐                    ┌─► accept_loop × listeners
//!   abort ───────────┼── Command (mpsc) ──┤   └─► accept_node ─► drive × nodes
//!   send_conn_test ──┤                    ├─► stdin bridge
//!   finish ──────────┘                    └─► writer × sinks
//! ```

use std::cell::RefCell;
use std::net::TcpListener as StdTcpListener;
use std::rc::Rc;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::bridge::output::{OutputPlan, Router};
use crate::bridge::stdin::{StdinBridge, StdinInput};
use crate::bridge::StdinTarget;
use crate::buffer::Buffer;
use crate::config::IoConfig;
use crate::listener::Acceptor;
use crate::node::{ConnectionEnv, NodeRegistry, ShutdownReason};
use crate::shared::Shared;
use crate::step::{Collaborators, StepParams};

/// Requests from the launcher thread
#[derive(Debug)]
pub(crate) enum Command {
    /// Stop accepting, shut every connection down, drain writers
    Shutdown,
    /// Force these connected nodes into shutdown
    NodesDown(Vec<u32>),
    /// Force every connection into shutdown
    Abort,
    /// Queue a sealed `ConnectionTest` frame to one node
    ConnectionTest { node_id: u32, buffer: Buffer },
}

/// Everything `create` prepared, moved onto the loop thread at `start`
pub(crate) struct LoopSetup {
    pub shared: Arc<Shared>,
    pub params: StepParams,
    pub config: IoConfig,
    pub collab: Collaborators,
    pub signature: Vec<u8>,
    pub listeners: Vec<StdTcpListener>,
    pub output: OutputPlan,
    pub stdin: Option<(StdinInput, StdinTarget)>,
}

/// Body of the event-loop thread; returns once shut down and drained
pub(crate) async fn run(setup: LoopSetup, mut commands: mpsc::UnboundedReceiver<Command>) {
    let LoopSetup {
        shared,
        params,
        config,
        collab,
        signature,
        listeners,
        output,
        stdin,
    } = setup;

    let (router, writers) = Router::spawn(output, Arc::clone(&shared));
    let env = Rc::new(ConnectionEnv {
        shared: Arc::clone(&shared),
        router: RefCell::new(router),
        collab: collab.clone(),
    });
    let nodes = Rc::new(NodeRegistry::new(params.node_count));

    let acceptor = Rc::new(Acceptor {
        env: Rc::clone(&env),
        nodes: Rc::clone(&nodes),
        signature,
        node_count: params.node_count,
        config: config.clone(),
    });
    let mut accept_tasks = Vec::with_capacity(listeners.len());
    for listener in listeners {
        match TcpListener::from_std(listener) {
            Ok(listener) => {
                accept_tasks.push(tokio::task::spawn_local(Rc::clone(&acceptor).accept_loop(listener)));
            }
            Err(e) => tracing::warn!(error = %e, "Failed to register listening socket"),
        }
    }

    let stdin_stop = Rc::new(Notify::new());
    let stdin_task = stdin.and_then(|(input, target)| {
        let destinations = match target {
            StdinTarget::Broadcast => (0..params.node_count).collect(),
            StdinTarget::Task(task) => match collab.layout.node_of_task(task) {
                Some(node) => vec![node],
                None => {
                    tracing::warn!(task, "Stdin target task has no node; stdin not forwarded");
                    return None;
                }
            },
        };
        let bridge = StdinBridge::new(
            Arc::clone(&shared),
            Rc::clone(&nodes),
            target,
            destinations,
            Rc::clone(&stdin_stop),
        );
        Some(tokio::task::spawn_local(bridge.run(input)))
    });

    tracing::info!(
        nodes = params.node_count,
        tasks = params.task_count,
        listeners = accept_tasks.len(),
        writers = writers.len(),
        stdin = stdin_task.is_some(),
        "Event loop running"
    );

    while let Some(command) = commands.recv().await {
        match command {
            Command::Shutdown => break,
            Command::NodesDown(ids) => {
                for node_id in ids {
                    if let Some(handle) = nodes.get(node_id) {
                        handle.request_shutdown(ShutdownReason::MarkedDown);
                    }
                }
            }
            Command::Abort => {
                for handle in nodes.all() {
                    handle.request_shutdown(ShutdownReason::Aborted);
                }
            }
            Command::ConnectionTest { node_id, buffer } => {
                let target = nodes.get(node_id);
                for share in shared.share_outgoing(buffer, 1) {
                    match &target {
                        Some(handle) => {
                            if let Err(share) = handle.enqueue(share) {
                                shared.release_outgoing(share);
                            }
                        }
                        None => shared.release_outgoing(share),
                    }
                }
            }
        }
    }

    // Shutdown
    let deadline = Instant::now() + config.drain_timeout();
    shared.update_nodes(|state| state.shutting_down = true);
    for task in &accept_tasks {
        task.abort();
    }
    stdin_stop.notify_one();
    for handle in nodes.all() {
        handle.request_shutdown(ShutdownReason::LoopShutdown);
    }

    if let Some(task) = stdin_task {
        if tokio::time::timeout_at(deadline, task).await.is_err() {
            tracing::warn!("Stdin bridge did not stop in time");
        }
    }
    if tokio::time::timeout_at(deadline, connections_finished(&shared, &nodes))
        .await
        .is_err()
    {
        tracing::warn!("Node connections did not close in time");
    }

    env.router.borrow_mut().close();
    for writer in writers {
        if tokio::time::timeout_at(deadline, writer).await.is_err() {
            tracing::warn!("Output writer did not drain in time");
            break;
        }
    }

    tracing::info!("Event loop stopped");
}

async fn connections_finished(shared: &Shared, nodes: &NodeRegistry) {
    loop {
        let notified = shared.nodes_changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if nodes.all().iter().all(|handle| handle.is_finished()) {
            return;
        }
        notified.await;
    }
}
