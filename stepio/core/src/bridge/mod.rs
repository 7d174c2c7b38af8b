//! Local File Bridges
//!
//! Adapters between the launcher's own descriptors and the frame queues:
//! - [`output`]: stdout/stderr writers fed by node connections
//! - [`stdin`]: the stdin reader that feeds node outbound queues
//! - [`filename`]: per-task / per-node output file patterns
//!
//! What the launcher hands in is described by [`LocalIo`]; everything that
//! can fail (opening files) happens in `Controller::create`, so a running
//! loop never has to report setup errors.

pub(crate) mod filename;
pub(crate) mod output;
pub(crate) mod stdin;

use std::fmt;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};

/// Where one output stream goes
#[derive(Default)]
pub enum OutputTarget {
    /// Not routed through this engine; frames are dropped
    #[default]
    NotHandled,
    /// The launcher's own stdout (or stderr, for the stderr stream)
    Terminal,
    /// Any async writer
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
    /// File name pattern, see the `%` tokens in the crate docs
    File(String),
    /// Share the stdout writer (stderr only)
    SameAsStdout,
}

impl fmt::Debug for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotHandled => f.write_str("NotHandled"),
            Self::Terminal => f.write_str("Terminal"),
            Self::Writer(_) => f.write_str("Writer(..)"),
            Self::File(pattern) => f.debug_tuple("File").field(pattern).finish(),
            Self::SameAsStdout => f.write_str("SameAsStdout"),
        }
    }
}

/// Where stdin comes from
#[derive(Default)]
pub enum StdinSource {
    /// Stdin is not forwarded
    #[default]
    NotHandled,
    /// The launcher's own stdin
    Terminal,
    /// A file, opened at `create`
    File(PathBuf),
    /// Any async reader
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl fmt::Debug for StdinSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotHandled => f.write_str("NotHandled"),
            Self::Terminal => f.write_str("Terminal"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

/// Which tasks receive stdin
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StdinTarget {
    /// Every task on every node (`AllStdin` frames)
    #[default]
    Broadcast,
    /// One task, by global task id (`Stdin` frames)
    Task(u32),
}

/// Local descriptors routed through the engine
#[derive(Debug, Default)]
pub struct LocalIo {
    /// Stdin source
    pub stdin: StdinSource,
    /// Stdin destination tasks
    pub stdin_target: StdinTarget,
    /// Stdout destination
    pub stdout: OutputTarget,
    /// Stderr destination
    pub stderr: OutputTarget,
    /// Only forward output of this global task id
    pub output_filter: Option<u32>,
}

impl LocalIo {
    /// Everything through the launcher's terminal, stderr on its own descriptor
    #[must_use]
    pub fn terminal() -> Self {
        Self {
            stdin: StdinSource::Terminal,
            stdin_target: StdinTarget::Broadcast,
            stdout: OutputTarget::Terminal,
            stderr: OutputTarget::Terminal,
            output_filter: None,
        }
    }

    /// Replace the stdin source
    #[must_use]
    pub fn with_stdin(mut self, source: StdinSource, target: StdinTarget) -> Self {
        self.stdin = source;
        self.stdin_target = target;
        self
    }

    /// Replace the stdout target
    #[must_use]
    pub fn with_stdout(mut self, target: OutputTarget) -> Self {
        self.stdout = target;
        self
    }

    /// Replace the stderr target
    #[must_use]
    pub fn with_stderr(mut self, target: OutputTarget) -> Self {
        self.stderr = target;
        self
    }

    /// Forward only one task's output
    #[must_use]
    pub fn with_output_filter(mut self, task: u32) -> Self {
        self.output_filter = Some(task);
        self
    }
}
