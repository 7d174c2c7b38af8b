//! Output Writers and Routing
//!
//! Each local sink gets one writer task fed by an unbounded channel of
//! incoming buffers. The channel is unbounded because the incoming pool
//! already caps how many buffers exist; a slow sink backs up into the pool
//! and from there into every node's read side.
//!
//! ```text
//!   NodeConnection ──route()──► Router ──► WriterHandle ──mpsc──► writer task ──► sink
//!                                  │                                  │
//!                                  └──── closed / filtered ───────────┴──► release
//! ```
//!
//! stdout and stderr that name the same sink share one writer, so their
//! writes serialize through one descriptor.

use std::cell::Cell;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::filename::{NameFields, NamePattern, PatternScope};
use super::OutputTarget;
use crate::buffer::Buffer;
use crate::config::OpenMode;
use crate::error::StepIoError;
use crate::protocol::FrameKind;
use crate::shared::Shared;
use crate::step::{StepLayout, StepParams};

/// A local destination, still owned by the launcher thread
pub(crate) enum Sink {
    Stdout,
    Stderr,
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
    File { path: PathBuf, file: std::fs::File },
}

impl Sink {
    fn describe(&self) -> String {
        match self {
            Self::Stdout => "stdout".to_string(),
            Self::Stderr => "stderr".to_string(),
            Self::Writer(_) => "writer".to_string(),
            Self::File { path, .. } => path.display().to_string(),
        }
    }

    /// Must run inside the event-loop runtime
    fn into_async(self) -> Box<dyn AsyncWrite + Unpin> {
        match self {
            Self::Stdout => Box::new(tokio::io::stdout()),
            Self::Stderr => Box::new(tokio::io::stderr()),
            Self::Writer(writer) => writer,
            Self::File { file, .. } => Box::new(tokio::fs::File::from_std(file)),
        }
    }
}

/// Which sink a frame lands in, as indices into `OutputPlan::sinks`
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RoutePlan {
    Discard,
    Single(usize),
    PerTask(Vec<usize>),
    PerNode(Vec<usize>),
}

impl RoutePlan {
    fn select(&self, task_id: u16, node_id: u32) -> Option<usize> {
        match self {
            Self::Discard => None,
            Self::Single(index) => Some(*index),
            Self::PerTask(indices) => indices.get(usize::from(task_id)).copied(),
            Self::PerNode(indices) => indices.get(node_id as usize).copied(),
        }
    }
}

/// Output routing resolved at `create`, with every file already open
pub(crate) struct OutputPlan {
    sinks: Vec<Sink>,
    stdout: RoutePlan,
    stderr: RoutePlan,
    filter: Option<u32>,
    label_width: Option<usize>,
}

impl OutputPlan {
    pub fn build(
        stdout: OutputTarget,
        stderr: OutputTarget,
        filter: Option<u32>,
        params: &StepParams,
        layout: &dyn StepLayout,
        mode: OpenMode,
    ) -> Result<Self, StepIoError> {
        let mut builder = SinkBuilder {
            sinks: Vec::new(),
            opened: HashMap::new(),
            params,
            layout,
            mode,
        };

        let stdout = match stdout {
            OutputTarget::SameAsStdout => {
                return Err(StepIoError::InvalidParams(
                    "stdout cannot alias itself".to_string(),
                ))
            }
            target => builder.plan(target, Sink::Stdout)?,
        };
        let stderr = match stderr {
            OutputTarget::SameAsStdout => stdout.clone(),
            target => builder.plan(target, Sink::Stderr)?,
        };

        Ok(Self {
            sinks: builder.sinks,
            stdout,
            stderr,
            filter,
            label_width: params.label.then(|| params.label_width()),
        })
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

struct SinkBuilder<'a> {
    sinks: Vec<Sink>,
    opened: HashMap<PathBuf, usize>,
    params: &'a StepParams,
    layout: &'a dyn StepLayout,
    mode: OpenMode,
}

impl SinkBuilder<'_> {
    fn plan(&mut self, target: OutputTarget, terminal: Sink) -> Result<RoutePlan, StepIoError> {
        match target {
            OutputTarget::NotHandled | OutputTarget::SameAsStdout => Ok(RoutePlan::Discard),
            OutputTarget::Terminal => Ok(RoutePlan::Single(self.push(terminal))),
            OutputTarget::Writer(writer) => Ok(RoutePlan::Single(self.push(Sink::Writer(writer)))),
            OutputTarget::File(pattern) => self.plan_files(&NamePattern::new(pattern)),
        }
    }

    fn plan_files(&mut self, pattern: &NamePattern) -> Result<RoutePlan, StepIoError> {
        let (job_id, step_id) = (self.params.job_id, self.params.step_id);
        match pattern.scope() {
            PatternScope::Single => {
                let path = pattern.expand(&NameFields {
                    job_id,
                    step_id,
                    ..Default::default()
                });
                Ok(RoutePlan::Single(self.open(path.into())?))
            }
            PatternScope::PerNode => {
                let mut indices = Vec::with_capacity(self.params.node_count as usize);
                for node in 0..self.params.node_count {
                    let hostname = self.layout.hostname(node);
                    let path = pattern.expand(&NameFields {
                        task: None,
                        node: Some(node),
                        hostname: Some(&hostname),
                        job_id,
                        step_id,
                    });
                    indices.push(self.open(path.into())?);
                }
                Ok(RoutePlan::PerNode(indices))
            }
            PatternScope::PerTask => {
                let mut indices = Vec::with_capacity(self.params.task_count as usize);
                for task in 0..self.params.task_count {
                    let node = self.layout.node_of_task(task);
                    let hostname = node.map(|n| self.layout.hostname(n));
                    let path = pattern.expand(&NameFields {
                        task: Some(task),
                        node,
                        hostname: hostname.as_deref(),
                        job_id,
                        step_id,
                    });
                    indices.push(self.open(path.into())?);
                }
                Ok(RoutePlan::PerTask(indices))
            }
        }
    }

    fn push(&mut self, sink: Sink) -> usize {
        self.sinks.push(sink);
        self.sinks.len() - 1
    }

    /// Open a file once; later requests for the same path share the sink
    fn open(&mut self, path: PathBuf) -> Result<usize, StepIoError> {
        if let Some(&index) = self.opened.get(&path) {
            return Ok(index);
        }

        let append = self.mode == OpenMode::Append;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)
            .map_err(|source| StepIoError::OpenFile {
                path: path.clone(),
                source,
            })?;
        tracing::debug!(path = %path.display(), "Opened output file");

        let index = self.push(Sink::File {
            path: path.clone(),
            file,
        });
        self.opened.insert(path, index);
        Ok(index)
    }
}

#[derive(Clone)]
struct WriterHandle {
    tx: mpsc::UnboundedSender<Buffer>,
    closed: Rc<Cell<bool>>,
}

/// Hands routed frames to writer tasks; lives on the event loop
pub(crate) struct Router {
    shared: Arc<Shared>,
    writers: Vec<WriterHandle>,
    stdout: RoutePlan,
    stderr: RoutePlan,
    filter: Option<u32>,
}

impl Router {
    /// Spawn one writer task per sink on the current `LocalSet`
    pub fn spawn(plan: OutputPlan, shared: Arc<Shared>) -> (Self, Vec<JoinHandle<()>>) {
        let mut writers = Vec::with_capacity(plan.sinks.len());
        let mut tasks = Vec::with_capacity(plan.sinks.len());

        for sink in plan.sinks {
            let (tx, rx) = mpsc::unbounded_channel();
            let closed = Rc::new(Cell::new(false));
            let name = sink.describe();
            tasks.push(tokio::task::spawn_local(run_writer(
                Arc::clone(&shared),
                sink.into_async(),
                name,
                rx,
                plan.label_width,
                Rc::clone(&closed),
            )));
            writers.push(WriterHandle { tx, closed });
        }

        let router = Self {
            shared,
            writers,
            stdout: plan.stdout,
            stderr: plan.stderr,
            filter: plan.filter,
        };
        (router, tasks)
    }

    /// Deliver a completed stdout/stderr frame from `node_id`
    pub fn route(&self, buffer: Buffer, node_id: u32) {
        let header = buffer.header();
        if let Some(task) = self.filter {
            if u32::from(header.global_task_id) != task {
                self.shared.release_incoming(buffer);
                return;
            }
        }

        let plan = match header.kind {
            FrameKind::Stdout => &self.stdout,
            FrameKind::Stderr => &self.stderr,
            _ => {
                self.shared.release_incoming(buffer);
                return;
            }
        };

        let writer = plan
            .select(header.global_task_id, node_id)
            .and_then(|index| self.writers.get(index));
        match writer {
            Some(writer) if !writer.closed.get() => {
                if let Err(mpsc::error::SendError(buffer)) = writer.tx.send(buffer) {
                    self.shared.release_incoming(buffer);
                }
            }
            _ => self.shared.release_incoming(buffer),
        }
    }

    /// Stop accepting frames; writer tasks finish their queues and exit
    pub fn close(&mut self) {
        self.writers.clear();
        self.stdout = RoutePlan::Discard;
        self.stderr = RoutePlan::Discard;
    }
}

async fn run_writer(
    shared: Arc<Shared>,
    mut sink: Box<dyn AsyncWrite + Unpin>,
    name: String,
    mut rx: mpsc::UnboundedReceiver<Buffer>,
    label_width: Option<usize>,
    closed: Rc<Cell<bool>>,
) {
    let mut written: u64 = 0;
    while let Some(buffer) = rx.recv().await {
        if closed.get() {
            shared.release_incoming(buffer);
            continue;
        }

        let result = write_frame(&mut sink, &buffer, label_width).await;
        written += buffer.payload().len() as u64;
        shared.release_incoming(buffer);

        if let Err(e) = result {
            tracing::warn!(sink = %name, error = %e, "Output write failed; closing writer");
            closed.set(true);
        }
    }

    if !closed.get() {
        if let Err(e) = sink.shutdown().await {
            tracing::debug!(sink = %name, error = %e, "Output shutdown failed");
        }
    }
    tracing::debug!(sink = %name, bytes = written, "Output writer finished");
}

async fn write_frame(
    sink: &mut (dyn AsyncWrite + Unpin),
    buffer: &Buffer,
    label_width: Option<usize>,
) -> std::io::Result<()> {
    match label_width {
        Some(width) => {
            let task = buffer.header().global_task_id;
            sink.write_all(&label_lines(buffer.payload(), task, width)).await?;
        }
        None => sink.write_all(buffer.payload()).await?,
    }
    sink.flush().await
}

/// Prefix every line of a chunk with `"{task:>width}: "`
///
/// A chunk that does not end in a newline gets one, so labelled lines from
/// different tasks never run together.
pub(crate) fn label_lines(payload: &[u8], task: u16, width: usize) -> Vec<u8> {
    let prefix = format!("{task:>width$}: ");
    let mut out = Vec::with_capacity(payload.len() + prefix.len() * 2 + 1);
    for line in payload.split_inclusive(|&b| b == b'\n') {
        out.extend_from_slice(prefix.as_bytes());
        out.extend_from_slice(line);
    }
    if out.last().is_some_and(|&b| b != b'\n') {
        out.push(b'\n');
    }
    out
}
