//! Task identity, execution, and content-addressed caching for gantry.
//!
//! This crate holds the single-task half of the engine: resolving declared
//! inputs to content, computing the content-addressed task hash, running the
//! command in an isolated environment, harvesting and normalizing declared
//! outputs, and persisting results in the cache so later runs can replay
//! them bit-for-bit.

pub mod cache;
pub mod exec;
pub mod harvest;
pub mod hash;
pub mod inputs;
pub mod normalize;
pub mod replay;
pub mod runner;
pub mod task;

pub use cache::{Cache, CacheEntry, DiskCache, MemoryCache};
pub use exec::{ExecutionContext, ExecutionOutput};
pub use harvest::Artifact;
pub use inputs::ResolvedInput;
pub use normalize::Normalizer;
pub use runner::{TaskRunner, TaskRunResult};
pub use task::Task;

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// The four failure classes every engine error falls into.
///
/// The class decides resumability and the process exit code: graph and
/// workspace failures are never resumable, execution failures are
/// conditionally resumable, system failures are resumable when checkpoints
/// survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    /// Schema, structural, or semantic graph invalidity.
    Graph,
    /// Missing or invalid workspace, output, or cache directories.
    Workspace,
    /// A task produced a non-zero exit code.
    Execution,
    /// Panics, unexpected I/O errors, cancellation faults.
    System,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Graph => write!(f, "graph"),
            Self::Workspace => write!(f, "workspace"),
            Self::Execution => write!(f, "execution"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Main error type for engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Structural or semantic graph invalidity.
    #[error("Graph error: {0}")]
    Graph(String),

    /// Missing or unusable workspace, output, or cache locations.
    #[error("Workspace error: {0}")]
    Workspace(String),

    /// A task-level execution fault (bad declaration, missing output).
    #[error("Execution error: {0}")]
    Execution(String),

    /// Internal invariant violations and unexpected runtime faults.
    #[error("System error: {0}")]
    System(String),

    /// An I/O operation failed against a concrete path.
    #[error("IO error during {operation} on {}: {source}", path.as_deref().map_or_else(|| "<none>".into(), |p| p.display().to_string()))]
    Io {
        /// The underlying I/O error.
        source: std::io::Error,
        /// Path the operation targeted, when known.
        path: Option<Box<Path>>,
        /// Short verb naming the operation ("open", "rename", ...).
        operation: String,
    },

    /// The run was cancelled cooperatively.
    #[error("Run cancelled")]
    Cancelled,
}

impl Error {
    /// Create a graph-class error.
    pub fn graph(msg: impl Into<String>) -> Self {
        Self::Graph(msg.into())
    }

    /// Create a workspace-class error.
    pub fn workspace(msg: impl Into<String>) -> Self {
        Self::Workspace(msg.into())
    }

    /// Create an execution-class error.
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Create a system-class error.
    pub fn system(msg: impl Into<String>) -> Self {
        Self::System(msg.into())
    }

    /// Wrap an I/O error with the path and operation that produced it.
    pub fn io(source: std::io::Error, path: &Path, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
            operation: operation.into(),
        }
    }

    /// The failure class this error belongs to.
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Graph(_) => FailureClass::Graph,
            Self::Workspace(_) => FailureClass::Workspace,
            Self::Execution(_) => FailureClass::Execution,
            Self::System(_) | Self::Io { .. } | Self::Cancelled => FailureClass::System,
        }
    }

    /// Short machine-readable code for failure records.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Graph(_) => "graph_invalid",
            Self::Workspace(_) => "workspace_invalid",
            Self::Execution(_) => "task_failed",
            Self::System(_) => "internal",
            Self::Io { .. } => "io",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
