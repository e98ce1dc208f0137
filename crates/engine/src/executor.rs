//! Depth-staged DAG execution with a deterministic observable log.
//!
//! One coordinator owns the only mutex; task bodies run on a worker pool
//! and never touch the lock. Dispatch happens depth by depth in lexical
//! order, and completion events are committed at each depth barrier in
//! lexical order, so the recorded trace is identical for every concurrency
//! level and any wall-clock timing.

use crate::planner::{Decision, IncrementalPlan};
use crate::trace::{EventKind, EventReason, Trace, TraceEvent, TraceRecorder};
use gantry_core::exec::ExecutionContext;
use gantry_core::runner::{TaskRunResult, TaskRunner};
use gantry_core::{Error, Result, Task};
use gantry_task_graph::{ExecutionState, TaskGraph, TaskState};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

/// Outcome of one node, as observed by callers and observers.
#[derive(Debug, Clone)]
pub struct NodeResult {
    /// Task name.
    pub name: String,
    /// Content-addressed task identity.
    pub hash: String,
    /// Captured or replayed stdout.
    pub stdout: Vec<u8>,
    /// Captured or replayed stderr.
    pub stderr: Vec<u8>,
    /// Exit status.
    pub exit_code: i32,
    /// Whether the result came from the cache.
    pub from_cache: bool,
    /// Artifact paths restored into the workspace.
    pub artifacts_restored: Vec<String>,
}

/// Final outcome of a whole-graph run.
#[derive(Debug, Clone)]
pub struct GraphResult {
    /// Terminal state of every node.
    pub final_states: BTreeMap<String, TaskState>,
    /// Results for nodes that executed or restored (skipped nodes absent).
    pub results: BTreeMap<String, NodeResult>,
}

impl GraphResult {
    /// Whether any node failed.
    #[must_use]
    pub fn any_failed(&self) -> bool {
        self.final_states.values().any(|s| *s == TaskState::Failed)
    }
}

/// Hook invoked at each successful terminal transition.
///
/// The recovery store uses this to persist checkpoints. An error from the
/// observer aborts the run.
pub trait Observer: Send + Sync {
    /// Called after a node reaches `COMPLETED` or `CACHED`, with the trace
    /// recorded so far.
    fn on_node_success(&self, task: &Task, result: &NodeResult, trace: &Trace) -> Result<()>;
}

enum BodyOutcome {
    /// The node ran (or replayed a cached failure) while `RUNNING`.
    Executed(TaskRunResult),
    /// The node's artifacts are in place while `CACHED`: restored by this
    /// body on a probe hit, or by the planner for a planned reuse.
    Restored {
        result: TaskRunResult,
        reason: EventReason,
    },
}

/// Buffered per-node completion, committed in lexical order at the depth
/// barrier.
struct Completion {
    node: usize,
    events: Vec<TraceEvent>,
    result: NodeResult,
    success: bool,
}

/// Drives a [`TaskGraph`] to completion.
pub struct DagExecutor {
    graph: Arc<TaskGraph>,
    runner: TaskRunner,
    plan: Option<IncrementalPlan>,
    recorder: TraceRecorder,
    observer: Option<Arc<dyn Observer>>,
    concurrency: usize,
}

impl DagExecutor {
    /// Create an executor. `concurrency` of 1 is serial execution; the
    /// observable log is identical for every value.
    #[must_use]
    pub fn new(
        graph: Arc<TaskGraph>,
        runner: TaskRunner,
        plan: Option<IncrementalPlan>,
        recorder: TraceRecorder,
        observer: Option<Arc<dyn Observer>>,
        concurrency: usize,
    ) -> Self {
        Self {
            graph,
            runner,
            plan,
            recorder,
            observer,
            concurrency: concurrency.max(1),
        }
    }

    /// Execute the whole graph.
    ///
    /// Non-zero task exits become `FAILED` states with downstream skips,
    /// not errors. Errors mean the run itself aborted: resolution or
    /// harvest failures, cache faults, observer failures, invariant
    /// violations, or cancellation.
    pub async fn execute(&self, ctx: &ExecutionContext) -> Result<GraphResult> {
        let state = Mutex::new(ExecutionState::new(&self.graph));
        let mut results: BTreeMap<String, NodeResult> = BTreeMap::new();

        for depth in 0..=self.graph.max_depth() {
            self.run_depth(depth, &state, &mut results, ctx).await?;
        }

        let final_state = state
            .lock()
            .map_err(|_| Error::system("execution state lock poisoned"))?;
        if !final_state.all_terminal() {
            return Err(Error::system(
                "run finished with non-terminal nodes; scheduler invariant broken",
            ));
        }

        self.emit_skip_events(&final_state);

        let final_states = self
            .graph
            .nodes()
            .iter()
            .enumerate()
            .map(|(index, task)| (task.name.clone(), final_state.state(index)))
            .collect();

        Ok(GraphResult {
            final_states,
            results,
        })
    }

    /// Dispatch and complete every node at one depth.
    async fn run_depth(
        &self,
        depth: usize,
        state: &Mutex<ExecutionState>,
        results: &mut BTreeMap<String, NodeResult>,
        ctx: &ExecutionContext,
    ) -> Result<()> {
        let to_dispatch: Vec<usize> = {
            let guard = state
                .lock()
                .map_err(|_| Error::system("execution state lock poisoned"))?;
            guard
                .ready(&self.graph)
                .into_iter()
                .filter(|&node| self.graph.depth(node) == depth)
                .collect()
        };
        if to_dispatch.is_empty() {
            return Ok(());
        }

        tracing::debug!(depth, nodes = to_dispatch.len(), "dispatching depth stage");

        let mut bodies: JoinSet<(usize, Result<BodyOutcome>)> = JoinSet::new();
        let mut completions: Vec<Completion> = Vec::new();
        let mut pending = to_dispatch.into_iter();
        let mut exhausted = false;

        loop {
            if ctx.cancel.is_cancelled() {
                bodies.abort_all();
                while bodies.join_next().await.is_some() {}
                return Err(Error::Cancelled);
            }

            while !exhausted && bodies.len() < self.concurrency {
                match pending.next() {
                    Some(node) => self.dispatch(node, state, ctx, &mut bodies)?,
                    None => exhausted = true,
                }
            }

            let Some(joined) = bodies.join_next().await else {
                break;
            };
            let (node, outcome) = joined.map_err(|e| {
                Error::system(format!("task body panicked or was aborted: {e}"))
            })?;
            let completion = self.commit(node, outcome, state)?;
            completions.push(completion);
        }

        // Depth barrier: emit completion events and observer calls in
        // lexical order so the log never depends on wall-clock timing.
        completions.sort_by(|a, b| {
            self.graph
                .node(a.node)
                .name
                .cmp(&self.graph.node(b.node).name)
        });
        for completion in completions {
            for event in completion.events {
                self.recorder.record(event);
            }
            let name = self.graph.node(completion.node).name.clone();
            if completion.success {
                if let Some(observer) = &self.observer {
                    observer.on_node_success(
                        self.graph.node(completion.node),
                        &completion.result,
                        &self.recorder.snapshot(),
                    )?;
                }
            }
            results.insert(name, completion.result);
        }

        Ok(())
    }

    /// Decide how to satisfy one ready node, transition it, and spawn its
    /// body.
    fn dispatch(
        &self,
        node: usize,
        state: &Mutex<ExecutionState>,
        ctx: &ExecutionContext,
        bodies: &mut JoinSet<(usize, Result<BodyOutcome>)>,
    ) -> Result<()> {
        let task = self.graph.node(node).clone();
        let planned = self
            .plan
            .as_ref()
            .map(|plan| plan.decision(&task.name));

        if planned == Some(Decision::ReuseCache) {
            self.recorder.record(
                TraceEvent::new(EventKind::TaskCached, &task.name)
                    .with_reason(EventReason::PlannedReuseCache),
            );
            self.transition(state, node, TaskState::Cached)?;
            let runner = self.runner.clone();
            let ctx = ctx.clone();
            bodies.spawn(async move {
                let outcome = replay_planned(&runner, &task, &ctx);
                (node, outcome)
            });
            return Ok(());
        }

        // Execute decision (planned or unplanned): probe before choosing
        // the transition, because a hit must become CACHED, not RUNNING.
        let task_hash = self.runner.resolve_hash(&task, ctx)?;
        let probed = if self.runner.read_cache {
            self.runner.cache.get(&task_hash)?
        } else {
            None
        };

        match probed {
            Some(entry) if entry.exit_code == 0 => {
                self.recorder.record(
                    TraceEvent::new(EventKind::TaskCached, &task.name)
                        .with_reason(EventReason::CacheHit),
                );
                self.transition(state, node, TaskState::Cached)?;
                let ctx = ctx.clone();
                bodies.spawn(async move {
                    let outcome = TaskRunner::replay_entry(&entry, &ctx).map(|result| {
                        BodyOutcome::Restored {
                            result,
                            reason: EventReason::CacheReplay,
                        }
                    });
                    (node, outcome)
                });
            }
            Some(entry) => {
                // A cached failure replays as that failure: the node runs
                // the recorded outcome instead of the command.
                self.transition(state, node, TaskState::Running)?;
                bodies.spawn(async move {
                    let result = TaskRunResult {
                        hash: entry.task_hash.clone(),
                        stdout: entry.stdout.clone(),
                        stderr: entry.stderr.clone(),
                        exit_code: entry.exit_code,
                        from_cache: true,
                        artifacts_restored: Vec::new(),
                    };
                    (node, Ok(BodyOutcome::Executed(result)))
                });
            }
            None => {
                self.transition(state, node, TaskState::Running)?;
                let runner = self.runner.clone();
                let ctx = ctx.clone();
                bodies.spawn(async move {
                    let outcome = runner
                        .execute_prepared(&task, &task_hash, &ctx)
                        .await
                        .map(BodyOutcome::Executed);
                    (node, outcome)
                });
            }
        }
        Ok(())
    }

    /// Commit one body outcome under the lock; completion events are
    /// buffered for the depth barrier.
    fn commit(
        &self,
        node: usize,
        outcome: Result<BodyOutcome>,
        state: &Mutex<ExecutionState>,
    ) -> Result<Completion> {
        let name = self.graph.node(node).name.clone();
        let planned_execute = self
            .plan
            .as_ref()
            .is_some_and(|plan| plan.decision(&name) == Decision::Execute);

        let mut guard = state
            .lock()
            .map_err(|_| Error::system("execution state lock poisoned"))?;

        match outcome {
            Ok(BodyOutcome::Executed(result)) => {
                let mut events = Vec::new();
                let success = result.exit_code == 0;
                if success {
                    guard.transition(&self.graph, node, TaskState::Completed)?;
                    let reason = if planned_execute {
                        EventReason::PlannedExecute
                    } else {
                        EventReason::FreshWork
                    };
                    events.push(TraceEvent::new(EventKind::TaskExecuted, &name).with_reason(reason));
                } else {
                    guard.fail_and_propagate(&self.graph, node)?;
                    events.push(TraceEvent::new(EventKind::TaskFailed, &name));
                }
                Ok(Completion {
                    node,
                    events,
                    result: node_result(&name, result),
                    success,
                })
            }
            Ok(BodyOutcome::Restored { result, reason }) => {
                let events = vec![
                    TraceEvent::new(EventKind::TaskArtifactsRestored, &name)
                        .with_reason(reason)
                        .with_artifacts(result.artifacts_restored.clone()),
                ];
                Ok(Completion {
                    node,
                    events,
                    result: node_result(&name, result),
                    success: true,
                })
            }
            Err(error) => Err(error),
        }
    }

    fn transition(
        &self,
        state: &Mutex<ExecutionState>,
        node: usize,
        to: TaskState,
    ) -> Result<()> {
        state
            .lock()
            .map_err(|_| Error::system("execution state lock poisoned"))?
            .transition(&self.graph, node, to)
    }

    /// Deferred skip events, in sorted name order, with deterministic
    /// causes.
    fn emit_skip_events(&self, state: &ExecutionState) {
        let mut skipped: Vec<usize> = (0..self.graph.len())
            .filter(|&node| state.state(node) == TaskState::Skipped)
            .collect();
        skipped.sort_by(|&a, &b| self.graph.node(a).name.cmp(&self.graph.node(b).name));

        for node in skipped {
            let mut event = TraceEvent::new(EventKind::TaskSkipped, &self.graph.node(node).name)
                .with_reason(EventReason::UpstreamFailed);
            if let Some(cause) = state.deterministic_cause(&self.graph, node) {
                event = event.with_cause(&self.graph.node(cause).name);
            }
            self.recorder.record(event);
        }
    }
}

fn node_result(name: &str, result: TaskRunResult) -> NodeResult {
    NodeResult {
        name: name.to_string(),
        hash: result.hash,
        stdout: result.stdout,
        stderr: result.stderr,
        exit_code: result.exit_code,
        from_cache: result.from_cache,
        artifacts_restored: result.artifacts_restored,
    }
}

/// Body for a planned `ReuseCache` node.
///
/// The planner already restored the artifacts while computing downstream
/// hashes, so the body only loads the entry to report the replayed result.
/// A vanished entry aborts the run, like any other cache fault behind a
/// committed decision.
fn replay_planned(
    runner: &TaskRunner,
    task: &Task,
    ctx: &ExecutionContext,
) -> Result<BodyOutcome> {
    let task_hash = runner.resolve_hash(task, ctx)?;
    let entry = runner.cache.get(&task_hash)?.ok_or_else(|| {
        Error::workspace(format!(
            "cache entry for planned reuse of '{}' disappeared",
            task.name
        ))
    })?;
    let artifacts_restored = entry.artifacts.iter().map(|a| a.path.clone()).collect();
    Ok(BodyOutcome::Restored {
        result: TaskRunResult {
            hash: entry.task_hash,
            stdout: entry.stdout,
            stderr: entry.stderr,
            exit_code: entry.exit_code,
            from_cache: true,
            artifacts_restored,
        },
        reason: EventReason::CacheRestore,
    })
}
