//! Deterministic DAG execution for gantry.
//!
//! This crate drives whole graphs: the serial/parallel executor, the
//! invalidation engine and incremental planner, the canonical trace, and
//! the durable recovery store with resume planning. Single-task mechanics
//! (hashing, execution, caching) live in `gantry-core`; graph structure
//! and the state machine live in `gantry-task-graph`.

pub mod executor;
pub mod invalidation;
pub mod planner;
pub mod recovery;
pub mod run;
pub mod trace;

pub use executor::{DagExecutor, GraphResult, NodeResult, Observer};
pub use planner::{Decision, IncrementalPlan};
pub use run::{Invocation, RunSummary};
pub use trace::{EventKind, EventReason, Trace, TraceEvent, TraceRecorder};

use serde::{Deserialize, Serialize};

/// How a run treats the cache and prior failed runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Cache treated as always-miss; writes discarded.
    Clean,
    /// Normal read/write cache with incremental planning.
    Incremental,
    /// Must resume an eligible prior failed run or fail immediately.
    ResumeOnly,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clean => write!(f, "clean"),
            Self::Incremental => write!(f, "incremental"),
            Self::ResumeOnly => write!(f, "resume-only"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clean" => Ok(Self::Clean),
            "incremental" => Ok(Self::Incremental),
            "resume-only" => Ok(Self::ResumeOnly),
            other => Err(format!(
                "unknown execution mode '{other}' (expected clean, incremental, or resume-only)"
            )),
        }
    }
}
