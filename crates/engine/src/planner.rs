//! The incremental planner: overlaying `{Execute, ReuseCache}` decisions
//! on the graph.
//!
//! There is deliberately no third "skip" decision: a `ReuseCache` node
//! always restores its artifacts so the workspace stays observationally
//! complete. Because output directories are wiped at run start and inputs
//! can include upstream outputs, each `ReuseCache` node's artifacts are
//! restored *during planning*, before any downstream hash is computed.

use crate::invalidation::InvalidationMap;
use crate::recovery::CheckpointRecord;
use gantry_core::{Cache, Error, Result, hash, inputs, replay};
use gantry_task_graph::TaskGraph;
use std::collections::BTreeMap;
use std::path::Path;

/// Per-task plan decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run the task body.
    Execute,
    /// Restore the cached result instead of executing.
    ReuseCache,
}

/// A deterministic execution overlay for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalPlan {
    /// Deterministic topological order (lexical tie-breaks).
    pub order: Vec<String>,
    /// Exactly one decision per task.
    pub decisions: BTreeMap<String, Decision>,
}

impl IncrementalPlan {
    /// The decision for `name`, defaulting to `Execute` for unknown names.
    #[must_use]
    pub fn decision(&self, name: &str) -> Decision {
        self.decisions
            .get(name)
            .copied()
            .unwrap_or(Decision::Execute)
    }
}

fn reuse_upstreams_ok(
    graph: &TaskGraph,
    index: usize,
    decisions: &BTreeMap<String, Decision>,
) -> bool {
    graph.parents(index).iter().all(|&parent| {
        decisions.get(&graph.node(parent).name) == Some(&Decision::ReuseCache)
    })
}

/// Try to reuse one node: hash it against the current workspace, probe the
/// cache, and restore on a hit. Returns the decision made.
fn try_reuse(
    graph: &TaskGraph,
    index: usize,
    cache: &Cache,
    workdir: &Path,
    strict: bool,
) -> Result<Decision> {
    let task = graph.node(index);
    let resolved = inputs::resolve(&task.inputs, workdir)?;
    let task_hash = hash::task_hash(workdir, task, &resolved);

    match cache.get(&task_hash)? {
        Some(entry) => {
            replay::restore(&entry, workdir)?;
            Ok(Decision::ReuseCache)
        }
        None if strict => Err(Error::workspace(format!(
            "cache entry for task '{}' ({task_hash}) disappeared; workspace is corrupt for resume",
            task.name
        ))),
        None => Ok(Decision::Execute),
    }
}

/// Build the plan: a task is `ReuseCache` iff it is not invalidated, its
/// cache entry exists, and every upstream is `ReuseCache`; otherwise
/// `Execute`.
///
/// With `strict` set (resume-only), a missing cache entry for a reusable
/// task rejects the run as workspace-corrupt instead of falling back.
pub fn plan(
    graph: &TaskGraph,
    invalidation: &InvalidationMap,
    cache: &Cache,
    workdir: &Path,
    strict: bool,
) -> Result<IncrementalPlan> {
    let order_indices = graph.topological_order();
    let mut decisions: BTreeMap<String, Decision> = BTreeMap::new();

    for &index in &order_indices {
        let task = graph.node(index);
        let invalidated = invalidation
            .get(&task.name)
            .is_none_or(|entry| entry.invalidated);

        let decision = if invalidated || !reuse_upstreams_ok(graph, index, &decisions) {
            Decision::Execute
        } else {
            try_reuse(graph, index, cache, workdir, strict)?
        };
        tracing::debug!(task = %task.name, ?decision, "plan decision");
        decisions.insert(task.name.clone(), decision);
    }

    Ok(IncrementalPlan {
        order: order_indices
            .into_iter()
            .map(|index| graph.node(index).name.clone())
            .collect(),
        decisions,
    })
}

/// Build a resume plan: checkpointed, hash-matching nodes with surviving
/// cache entries become `ReuseCache`; all others `Execute`.
pub fn resume_plan(
    graph: &TaskGraph,
    checkpoints: &BTreeMap<String, CheckpointRecord>,
    cache: &Cache,
    workdir: &Path,
) -> Result<IncrementalPlan> {
    let order_indices = graph.topological_order();
    let mut decisions: BTreeMap<String, Decision> = BTreeMap::new();

    for &index in &order_indices {
        let task = graph.node(index);
        let checkpoint = checkpoints.get(&task.name).filter(|c| c.valid);

        let decision = match checkpoint {
            Some(checkpoint) if reuse_upstreams_ok(graph, index, &decisions) => {
                let resolved = inputs::resolve(&task.inputs, workdir)?;
                let task_hash = hash::task_hash(workdir, task, &resolved);
                if checkpoint.cache_keys.contains(&task_hash) && cache.has(&task_hash) {
                    match cache.get(&task_hash)? {
                        Some(entry) => {
                            replay::restore(&entry, workdir)?;
                            Decision::ReuseCache
                        }
                        None => Decision::Execute,
                    }
                } else {
                    Decision::Execute
                }
            }
            _ => Decision::Execute,
        };
        tracing::debug!(task = %task.name, ?decision, "resume plan decision");
        decisions.insert(task.name.clone(), decision);
    }

    Ok(IncrementalPlan {
        order: order_indices
            .into_iter()
            .map(|index| graph.node(index).name.clone())
            .collect(),
        decisions,
    })
}
