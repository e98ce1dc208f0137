//! Per-run execution state and the transition rules that guard it.

use crate::TaskGraph;
use gantry_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};

/// Lifecycle state of one node in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    /// Not yet dispatched.
    Pending,
    /// Task body in flight.
    Running,
    /// Executed successfully.
    Completed,
    /// Executed with a non-zero exit.
    Failed,
    /// Skipped because an ancestor failed.
    Skipped,
    /// Satisfied from the cache.
    Cached,
}

impl TaskState {
    /// Whether the state is final.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cached
        )
    }

    /// Whether the state satisfies downstream dependencies.
    #[must_use]
    pub fn is_successful(self) -> bool {
        matches!(self, Self::Completed | Self::Cached)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::Cached => "CACHED",
        };
        write!(f, "{s}")
    }
}

/// Mutable per-run state map, separate from the immutable graph.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    states: Vec<TaskState>,
    skip_cause: Vec<Option<usize>>,
}

impl ExecutionState {
    /// Fresh state with every node `PENDING`.
    #[must_use]
    pub fn new(graph: &TaskGraph) -> Self {
        Self {
            states: vec![TaskState::Pending; graph.len()],
            skip_cause: vec![None; graph.len()],
        }
    }

    /// State of the node at canonical index `index`.
    #[must_use]
    pub fn state(&self, index: usize) -> TaskState {
        self.states[index]
    }

    /// The recorded cause for a skipped node.
    #[must_use]
    pub fn skip_cause(&self, index: usize) -> Option<usize> {
        self.skip_cause[index]
    }

    /// Whether every node reached a terminal state.
    #[must_use]
    pub fn all_terminal(&self) -> bool {
        self.states.iter().all(|s| s.is_terminal())
    }

    /// Whether any node failed.
    #[must_use]
    pub fn any_failed(&self) -> bool {
        self.states.iter().any(|s| *s == TaskState::Failed)
    }

    /// Ready nodes: `PENDING` with every parent successful, sorted by
    /// `(depth ASC, name ASC)` with byte-wise name comparison.
    #[must_use]
    pub fn ready(&self, graph: &TaskGraph) -> Vec<usize> {
        let mut ready: Vec<usize> = (0..graph.len())
            .filter(|&index| {
                self.states[index] == TaskState::Pending
                    && graph
                        .parents(index)
                        .iter()
                        .all(|&parent| self.states[parent].is_successful())
            })
            .collect();
        ready.sort_by(|&a, &b| {
            graph
                .depth(a)
                .cmp(&graph.depth(b))
                .then_with(|| graph.node(a).name.as_bytes().cmp(graph.node(b).name.as_bytes()))
        });
        ready
    }

    /// Apply one of the allowed transitions.
    ///
    /// # Errors
    ///
    /// Any transition outside the allowed table is a system-class
    /// invariant violation.
    pub fn transition(&mut self, graph: &TaskGraph, index: usize, to: TaskState) -> Result<()> {
        let from = self.states[index];
        let allowed = matches!(
            (from, to),
            (TaskState::Pending, TaskState::Running)
                | (TaskState::Pending, TaskState::Cached)
                | (TaskState::Pending, TaskState::Skipped)
                | (TaskState::Running, TaskState::Completed)
                | (TaskState::Running, TaskState::Failed)
        );
        if !allowed {
            return Err(Error::system(format!(
                "illegal state transition {from} -> {to} for task '{}'",
                graph.node(index).name
            )));
        }
        tracing::trace!(task = %graph.node(index).name, %from, %to, "state transition");
        self.states[index] = to;
        Ok(())
    }

    /// Transition `failed` from `RUNNING` to `FAILED` and skip everything
    /// reachable from it.
    ///
    /// Traversal is a BFS over a min-heap of canonical indices so the
    /// visit order is deterministic. Reachable `PENDING` nodes move to
    /// `SKIPPED` with a recorded cause; a reachable `RUNNING` node means a
    /// missing synchronization upstream and aborts the run.
    ///
    /// Returns the newly skipped indices in ascending canonical order.
    pub fn fail_and_propagate(
        &mut self,
        graph: &TaskGraph,
        failed: usize,
    ) -> Result<Vec<usize>> {
        self.transition(graph, failed, TaskState::Failed)?;

        let mut heap: BinaryHeap<Reverse<usize>> = graph
            .children(failed)
            .iter()
            .map(|&child| Reverse(child))
            .collect();
        let mut visited: BTreeSet<usize> = BTreeSet::new();
        let mut skipped = Vec::new();

        while let Some(Reverse(node)) = heap.pop() {
            if !visited.insert(node) {
                continue;
            }
            match self.states[node] {
                TaskState::Running => {
                    return Err(Error::system(format!(
                        "task '{}' is RUNNING downstream of failed task '{}'",
                        graph.node(node).name,
                        graph.node(failed).name
                    )));
                }
                TaskState::Pending => {
                    self.states[node] = TaskState::Skipped;
                    self.skip_cause[node] = Some(failed);
                    skipped.push(node);
                }
                TaskState::Skipped => {
                    // A second failure may be the lexically smaller cause.
                    let current = self.skip_cause[node];
                    let replace = current.is_none_or(|cause| {
                        graph.node(failed).name < graph.node(cause).name
                    });
                    if replace {
                        self.skip_cause[node] = Some(failed);
                    }
                }
                TaskState::Completed | TaskState::Failed | TaskState::Cached => {}
            }
            for &child in graph.children(node) {
                if !visited.contains(&child) {
                    heap.push(Reverse(child));
                }
            }
        }

        Ok(skipped)
    }

    /// The deterministic skip cause: the lexically smallest `FAILED`
    /// ancestor of `index`.
    #[must_use]
    pub fn deterministic_cause(&self, graph: &TaskGraph, index: usize) -> Option<usize> {
        graph
            .ancestors(index)
            .into_iter()
            .filter(|&ancestor| self.states[ancestor] == TaskState::Failed)
            .min_by(|&a, &b| graph.node(a).name.cmp(&graph.node(b).name))
    }
}
