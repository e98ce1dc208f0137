//! Validated task DAG and execution state machine for gantry.
//!
//! [`TaskGraph`] is immutable after construction: validation (unique
//! names, known edge endpoints, no self-loops, no duplicate edges, no
//! cycles) happens once, along with the canonical node order, adjacency,
//! indegrees, topological depths, and the insertion-order-invariant
//! [`TaskGraph::graph_hash`]. Per-run mutable state lives in
//! [`ExecutionState`], so one graph serves many runs.

mod graph;
mod state;

pub use graph::{TaskGraph, task_def_hash};
pub use state::{ExecutionState, TaskState};
