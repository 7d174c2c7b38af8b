//! Step Description and Collaborators
//!
//! The engine does not compute task layouts, name nodes, or issue
//! credentials. It consumes them through the traits here:
//! - `CredentialProvider`: the signature every handshake must carry
//! - `StepLayout`: node hostnames and the task -> node mapping
//! - `NodeFailureHandler`: told when a registered node's connection dies

use std::fmt;
use std::sync::Arc;

use crate::error::StepIoError;

/// Size and presentation of one job step
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepParams {
    /// Tasks across the whole step
    pub task_count: u32,
    /// Nodes in the step
    pub node_count: u32,
    /// Prefix output lines with the task id
    pub label: bool,
    /// Job id, used by output file patterns
    pub job_id: u32,
    /// Step id, used by output file patterns
    pub step_id: u32,
}

impl StepParams {
    /// Step with the given shape and no labels
    #[must_use]
    pub fn new(task_count: u32, node_count: u32) -> Self {
        Self {
            task_count,
            node_count,
            label: false,
            job_id: 0,
            step_id: 0,
        }
    }

    /// Enable or disable task labels
    #[must_use]
    pub fn with_label(mut self, label: bool) -> Self {
        self.label = label;
        self
    }

    /// Set job and step ids
    #[must_use]
    pub fn with_ids(mut self, job_id: u32, step_id: u32) -> Self {
        self.job_id = job_id;
        self.step_id = step_id;
        self
    }

    /// Digits needed to print the highest task id
    #[must_use]
    pub fn label_width(&self) -> usize {
        let highest = self.task_count.saturating_sub(1);
        highest.to_string().len()
    }

    pub(crate) fn validate(&self) -> Result<(), StepIoError> {
        if self.node_count == 0 {
            return Err(StepIoError::InvalidParams("node_count is zero".to_string()));
        }
        if self.task_count < self.node_count {
            return Err(StepIoError::InvalidParams(format!(
                "{} tasks cannot cover {} nodes",
                self.task_count, self.node_count
            )));
        }
        if self.task_count > u32::from(u16::MAX) + 1 {
            return Err(StepIoError::InvalidParams(format!(
                "{} tasks exceed the 16-bit task id space",
                self.task_count
            )));
        }
        Ok(())
    }
}

/// Source of the job credential signature
pub trait CredentialProvider: Send + Sync {
    /// Signature every node must present in its handshake
    fn signature(&self) -> Vec<u8>;
}

/// Credential known up front
#[derive(Clone)]
pub struct StaticCredential(pub Vec<u8>);

impl CredentialProvider for StaticCredential {
    fn signature(&self) -> Vec<u8> {
        self.0.clone()
    }
}

impl fmt::Debug for StaticCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StaticCredential({} bytes)", self.0.len())
    }
}

/// Node naming and task placement
pub trait StepLayout: Send + Sync {
    /// Hostname of a node, for log and error messages
    fn hostname(&self, node_id: u32) -> String;

    /// Node running a task
    fn node_of_task(&self, task_id: u32) -> Option<u32>;
}

/// Tasks dealt out to nodes in contiguous blocks
#[derive(Clone, Debug)]
pub struct BlockLayout {
    hostnames: Vec<String>,
    /// First task id on each node, plus one trailing total
    starts: Vec<u32>,
}

impl BlockLayout {
    /// Layout from per-node task counts and hostnames
    ///
    /// Missing hostnames default to `node<N>`.
    #[must_use]
    pub fn new(tasks_per_node: &[u32], hostnames: Vec<String>) -> Self {
        let mut starts = Vec::with_capacity(tasks_per_node.len() + 1);
        let mut next = 0;
        for count in tasks_per_node {
            starts.push(next);
            next += count;
        }
        starts.push(next);

        let mut hostnames = hostnames;
        for node in hostnames.len()..tasks_per_node.len() {
            hostnames.push(format!("node{node}"));
        }

        Self { hostnames, starts }
    }

    /// The same number of tasks on every node
    #[must_use]
    pub fn uniform(node_count: u32, tasks_per_node: u32) -> Self {
        Self::new(&vec![tasks_per_node; node_count as usize], Vec::new())
    }

    /// Tasks on one node
    #[must_use]
    pub fn tasks_on(&self, node_id: u32) -> std::ops::Range<u32> {
        let i = node_id as usize;
        match (self.starts.get(i), self.starts.get(i + 1)) {
            (Some(&start), Some(&end)) => start..end,
            _ => 0..0,
        }
    }
}

impl StepLayout for BlockLayout {
    fn hostname(&self, node_id: u32) -> String {
        self.hostnames
            .get(node_id as usize)
            .cloned()
            .unwrap_or_else(|| format!("node{node_id}"))
    }

    fn node_of_task(&self, task_id: u32) -> Option<u32> {
        let total = *self.starts.last()?;
        if task_id >= total {
            return None;
        }
        // starts is sorted; the node is the last start <= task_id
        let idx = self.starts.partition_point(|&start| start <= task_id);
        u32::try_from(idx - 1).ok()
    }
}

/// Receiver of node-failure reports
pub trait NodeFailureHandler: Send + Sync {
    /// A registered node's connection died on a transport error
    fn node_failed(&self, node_id: u32, hostname: &str);
}

impl<F> NodeFailureHandler for F
where
    F: Fn(u32, &str) + Send + Sync,
{
    fn node_failed(&self, node_id: u32, hostname: &str) {
        self(node_id, hostname);
    }
}

/// Everything the engine consumes from the rest of the launcher
#[derive(Clone)]
pub struct Collaborators {
    /// Job credential
    pub credential: Arc<dyn CredentialProvider>,
    /// Node names and task placement
    pub layout: Arc<dyn StepLayout>,
    /// Node failure callback
    pub on_node_failure: Arc<dyn NodeFailureHandler>,
}

impl Collaborators {
    /// Collaborators whose failure handler only logs
    pub fn new(
        credential: impl CredentialProvider + 'static,
        layout: impl StepLayout + 'static,
    ) -> Self {
        Self {
            credential: Arc::new(credential),
            layout: Arc::new(layout),
            on_node_failure: Arc::new(|node_id: u32, hostname: &str| {
                tracing::warn!(node_id, hostname, "Node failed; no failure handler installed");
            }),
        }
    }

    /// Install a failure handler
    #[must_use]
    pub fn with_failure_handler(mut self, handler: impl NodeFailureHandler + 'static) -> Self {
        self.on_node_failure = Arc::new(handler);
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
