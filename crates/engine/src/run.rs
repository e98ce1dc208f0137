//! Whole-run orchestration: workspace preparation, invalidation,
//! planning, execution, and durable records.
//!
//! Every terminated run leaves a run record, a failure record when it did
//! not succeed, and a valid canonical trace, whichever path it took out.

use crate::executor::{DagExecutor, GraphResult, NodeResult, Observer};
use crate::invalidation::{self, GraphSnapshot, InvalidationMap, ReasonKind};
use crate::planner::{self, IncrementalPlan};
use crate::recovery::{
    CheckpointRecord, FailureRecord, RecoveryStore, ResumeContext, RunRecord, RunStatus,
    check_resume_eligibility, write_atomic,
};
use crate::trace::{EventKind, Trace, TraceEvent, TraceRecorder};
use crate::ExecutionMode;
use chrono::Utc;
use gantry_core::cache::{Cache, DiskCache};
use gantry_core::exec::ExecutionContext;
use gantry_core::harvest::{self, Artifact};
use gantry_core::normalize::Normalizer;
use gantry_core::runner::TaskRunner;
use gantry_core::{Error, FailureClass, Result, Task};
use gantry_task_graph::{TaskGraph, TaskState};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Canonical invocation, already resolved by the caller.
///
/// Relative paths were resolved against the working directory by the CLI;
/// the engine never consults the process CWD or host environment.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Absolute workspace directory tasks run in.
    pub workdir: PathBuf,
    /// Cache root directory.
    pub cache_dir: PathBuf,
    /// Output directory, wiped at run start.
    pub output_dir: PathBuf,
    /// Execution mode.
    pub mode: ExecutionMode,
    /// Where to write the canonical trace, if anywhere.
    pub trace_path: Option<PathBuf>,
    /// Worker pool width; 1 is serial.
    pub concurrency: usize,
    /// Explicit run to resume; auto-detected when absent.
    pub previous_run_id: Option<String>,
}

/// What a terminated run reports back.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// This run's id.
    pub run_id: String,
    /// Graph identity.
    pub graph_hash: String,
    /// Hash of the canonical trace bytes.
    pub trace_hash: String,
    /// 0 when every task succeeded, 1 when any task failed.
    pub exit_code: i32,
    /// Terminal state of every node.
    pub final_states: BTreeMap<String, TaskState>,
    /// Per-node results for nodes that executed or restored.
    pub results: BTreeMap<String, NodeResult>,
}

/// Combined content hash over a sorted artifact list.
fn artifacts_hash(artifacts: &[Artifact]) -> String {
    let mut hasher = Sha256::new();
    hasher.update((artifacts.len() as u64).to_be_bytes());
    for artifact in artifacts {
        hasher.update((artifact.path.len() as u64).to_be_bytes());
        hasher.update(artifact.path.as_bytes());
        hasher.update((artifact.content.len() as u64).to_be_bytes());
        hasher.update(&artifact.content);
    }
    hex::encode(hasher.finalize())
}

/// Writes a validated checkpoint after each successful node.
struct CheckpointObserver {
    store: RecoveryStore,
    run_id: String,
    cache: Cache,
    normalizer: Normalizer,
    workdir: PathBuf,
}

impl Observer for CheckpointObserver {
    fn on_node_success(&self, task: &Task, result: &NodeResult, trace: &Trace) -> Result<()> {
        if result.exit_code != 0 {
            return Ok(());
        }
        // The cache entry for the node's hash must survive.
        let Some(entry) = self.cache.get(&result.hash)? else {
            return Ok(());
        };
        // Re-harvesting the declared outputs must reproduce the entry.
        let Ok(harvested) = harvest::harvest(&task.outputs, &self.workdir, self.normalizer) else {
            tracing::warn!(task = %task.name, "re-harvest failed; checkpoint withheld");
            return Ok(());
        };
        let output_hash = artifacts_hash(&harvested);
        if output_hash != artifacts_hash(&entry.artifacts) {
            tracing::warn!(task = %task.name, "outputs drifted; checkpoint withheld");
            return Ok(());
        }
        // The trace so far must carry the node's events and no failure.
        let has_required = trace.events.iter().any(|event| {
            event.task_id == task.name
                && matches!(event.kind, EventKind::TaskExecuted | EventKind::TaskCached)
        });
        let has_failure = trace
            .events
            .iter()
            .any(|event| event.task_id == task.name && event.kind == EventKind::TaskFailed);
        if !has_required || has_failure {
            return Ok(());
        }

        self.store.write_checkpoint(
            &self.run_id,
            &CheckpointRecord {
                node_id: task.name.clone(),
                timestamp: Utc::now(),
                cache_keys: vec![result.hash.clone()],
                output_hash,
                valid: true,
            },
        )
    }
}

fn validate_workspace(invocation: &Invocation) -> Result<()> {
    if !invocation.workdir.is_absolute() {
        return Err(Error::workspace(format!(
            "working directory '{}' is not absolute",
            invocation.workdir.display()
        )));
    }
    if !invocation.workdir.is_dir() {
        return Err(Error::workspace(format!(
            "working directory '{}' does not exist",
            invocation.workdir.display()
        )));
    }
    if invocation.output_dir == invocation.workdir
        || invocation.workdir.starts_with(&invocation.output_dir)
    {
        return Err(Error::workspace(format!(
            "output directory '{}' would wipe the workspace",
            invocation.output_dir.display()
        )));
    }
    Ok(())
}

/// Wipe the output directory so only the current run's artifacts remain.
fn wipe_output_dir(output_dir: &Path) -> Result<()> {
    match fs::remove_dir_all(output_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) if output_dir.is_file() => {
            return Err(Error::workspace(format!(
                "output path '{}' is a file: {e}",
                output_dir.display()
            )));
        }
        Err(e) => return Err(Error::io(e, output_dir, "remove_dir_all")),
    }
    fs::create_dir_all(output_dir).map_err(|e| Error::io(e, output_dir, "create_dir_all"))
}

fn emit_invalidation_events(recorder: &TraceRecorder, invalidation: &InvalidationMap) {
    for (name, entry) in invalidation {
        if !entry.invalidated {
            continue;
        }
        for reason in &entry.reasons {
            let mut event = TraceEvent::new(EventKind::TaskInvalidated, name)
                .with_reason_text(reason.canonical_string());
            if reason.kind == ReasonKind::DependencyInvalidated {
                if let Some(source) = &reason.source_task_id {
                    event = event.with_cause(source);
                }
            }
            recorder.record(event);
        }
    }
}

/// Resolved planning outcome for one run.
struct RunSetup {
    plan: Option<IncrementalPlan>,
    retry_count: u32,
    previous_run_id: Option<String>,
}

fn load_resume_context(
    store: &RecoveryStore,
    previous: RunRecord,
) -> Result<ResumeContext> {
    let failure = store.load_failure(&previous.run_id)?.ok_or_else(|| {
        Error::workspace(format!(
            "run {} has no failure record; nothing to resume",
            previous.run_id
        ))
    })?;
    let checkpoints = store.load_checkpoints(&previous.run_id)?;
    let snapshot = store.load_snapshot(&previous.run_id)?.unwrap_or_default();
    Ok(ResumeContext {
        previous,
        failure,
        checkpoints,
        snapshot,
    })
}

fn plan_run(
    graph: &TaskGraph,
    invocation: &Invocation,
    store: &RecoveryStore,
    cache: &Cache,
    recorder: &TraceRecorder,
    new_snapshot: &GraphSnapshot,
) -> Result<RunSetup> {
    let resume_candidate = match &invocation.previous_run_id {
        Some(run_id) => Some(store.load_run(run_id).map_err(|e| {
            Error::workspace(format!("previous run '{run_id}' did not load: {e}"))
        })?),
        None => store.find_previous_failed(graph.graph_hash())?,
    };

    if let Some(previous) = resume_candidate {
        let context = load_resume_context(store, previous)?;
        let invalidation = invalidation::compute(&context.snapshot, graph, new_snapshot);
        emit_invalidation_events(recorder, &invalidation);

        match check_resume_eligibility(invocation.mode, graph, &context, &invalidation) {
            Ok(()) => {
                tracing::info!(previous = %context.previous.run_id, "resuming failed run");
                let plan = planner::resume_plan(graph, &context.checkpoints, cache, &invocation.workdir)?;
                return Ok(RunSetup {
                    plan: Some(plan),
                    retry_count: context.previous.retry_count + 1,
                    previous_run_id: Some(context.previous.run_id),
                });
            }
            Err(e) if invocation.mode == ExecutionMode::ResumeOnly => return Err(e),
            Err(e) => {
                tracing::info!(%e, "previous run not resumable; planning fresh");
                let plan = planner::plan(graph, &invalidation, cache, &invocation.workdir, false)?;
                return Ok(RunSetup {
                    plan: Some(plan),
                    retry_count: 0,
                    previous_run_id: None,
                });
            }
        }
    }

    if invocation.mode == ExecutionMode::ResumeOnly {
        return Err(Error::workspace(
            "resume-only run found no matching failed run to resume",
        ));
    }

    let old_snapshot = store
        .latest_snapshot()?
        .map(|(_, snapshot)| snapshot)
        .unwrap_or_default();
    let invalidation = invalidation::compute(&old_snapshot, graph, new_snapshot);
    emit_invalidation_events(recorder, &invalidation);
    let plan = planner::plan(graph, &invalidation, cache, &invocation.workdir, false)?;
    Ok(RunSetup {
        plan: Some(plan),
        retry_count: 0,
        previous_run_id: None,
    })
}

fn write_trace_file(invocation: &Invocation, trace: &Trace) -> Result<()> {
    if let Some(path) = &invocation.trace_path {
        write_atomic(path, &trace.canonical_bytes())?;
    }
    Ok(())
}

fn resumable_for(class: FailureClass, has_checkpoints: bool) -> bool {
    match class {
        FailureClass::Graph | FailureClass::Workspace => false,
        FailureClass::Execution => true,
        FailureClass::System => has_checkpoints,
    }
}

/// Execute one run of `graph` under `invocation`.
///
/// Returns a summary (exit code 0 or 1) for runs that terminate through
/// the state machine; any error means the run aborted, with records
/// already persisted.
pub async fn execute_run(
    graph: Arc<TaskGraph>,
    invocation: &Invocation,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    validate_workspace(invocation)?;
    wipe_output_dir(&invocation.output_dir)?;

    let disk = DiskCache::new(&invocation.cache_dir)
        .map_err(|e| Error::workspace(format!("cache directory unusable: {e}")))?;
    let cache = Cache::Persistent(disk);
    let store = RecoveryStore::open(&invocation.workdir)?;

    let recorder = TraceRecorder::new(graph.graph_hash());
    // An empty valid trace up-front, so a crashed run still leaves a
    // well-formed artifact for this graph hash.
    write_trace_file(invocation, &Trace::empty(graph.graph_hash()))?;

    let record = RunRecord {
        run_id: uuid::Uuid::new_v4().to_string(),
        graph_hash: graph.graph_hash().to_string(),
        start_time: Utc::now(),
        mode: invocation.mode,
        retry_count: 0,
        status: RunStatus::Running,
        previous_run_id: None,
    };
    store.write_run(&record)?;

    match run_inner(&graph, invocation, &store, &cache, &recorder, record.clone(), cancel).await {
        Ok(summary) => Ok(summary),
        Err(error) => {
            let trace = recorder.snapshot();
            let _ = write_trace_file(invocation, &trace);
            let has_checkpoints = store
                .load_checkpoints(&record.run_id)
                .map(|c| !c.is_empty())
                .unwrap_or(false);
            let status = if matches!(error, Error::Cancelled) {
                RunStatus::Cancelled
            } else {
                RunStatus::Failed
            };
            let _ = store.write_failure(
                &record.run_id,
                &FailureRecord {
                    failure_class: error.class(),
                    node_id: None,
                    error_code: error.code().to_string(),
                    error_message: error.to_string(),
                    resumable: resumable_for(error.class(), has_checkpoints),
                },
            );
            let _ = store.write_run(&RunRecord { status, ..record });
            Err(error)
        }
    }
}

async fn run_inner(
    graph: &Arc<TaskGraph>,
    invocation: &Invocation,
    store: &RecoveryStore,
    cache: &Cache,
    recorder: &TraceRecorder,
    mut record: RunRecord,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let snapshot = GraphSnapshot::capture(graph, &invocation.workdir)?;
    store.write_snapshot(&record.run_id, &snapshot)?;

    let (runner, setup) = match invocation.mode {
        ExecutionMode::Clean => (
            TaskRunner::detached(cache.clone(), Normalizer::default()),
            RunSetup {
                plan: None,
                retry_count: 0,
                previous_run_id: None,
            },
        ),
        ExecutionMode::Incremental | ExecutionMode::ResumeOnly => {
            let runner = TaskRunner::new(cache.clone(), Normalizer::default());
            let setup = plan_run(graph, invocation, store, cache, recorder, &snapshot)?;
            (runner, setup)
        }
    };

    if setup.retry_count != record.retry_count || setup.previous_run_id.is_some() {
        record.retry_count = setup.retry_count;
        record.previous_run_id = setup.previous_run_id.clone();
        store.write_run(&record)?;
    }

    let observer: Arc<dyn Observer> = Arc::new(CheckpointObserver {
        store: store.clone(),
        run_id: record.run_id.clone(),
        cache: cache.clone(),
        normalizer: runner.normalizer,
        workdir: invocation.workdir.clone(),
    });

    let executor = DagExecutor::new(
        Arc::clone(graph),
        runner,
        setup.plan,
        recorder.clone(),
        Some(observer),
        invocation.concurrency,
    );
    let ctx = ExecutionContext {
        workdir: invocation.workdir.clone(),
        cancel,
    };

    let result = executor.execute(&ctx).await?;
    let trace = recorder.snapshot();
    write_trace_file(invocation, &trace)?;
    finalize_terminated(store, &record, &result)?;
    Ok(RunSummary {
        run_id: record.run_id,
        graph_hash: graph.graph_hash().to_string(),
        trace_hash: trace.trace_hash(),
        exit_code: i32::from(result.any_failed()),
        final_states: result.final_states,
        results: result.results,
    })
}

/// Persist final records for a run that terminated through the state
/// machine.
fn finalize_terminated(
    store: &RecoveryStore,
    record: &RunRecord,
    result: &GraphResult,
) -> Result<()> {
    if result.any_failed() {
        // Lexically smallest failed node anchors the failure record.
        let failed_node = result
            .final_states
            .iter()
            .find(|(_, state)| **state == TaskState::Failed)
            .map(|(name, _)| name.clone());
        let exit_code = failed_node
            .as_ref()
            .and_then(|name| result.results.get(name))
            .map_or(1, |node| node.exit_code);
        store.write_failure(
            &record.run_id,
            &FailureRecord {
                failure_class: FailureClass::Execution,
                node_id: failed_node.clone(),
                error_code: "task_failed".to_string(),
                error_message: match &failed_node {
                    Some(name) => format!("task '{name}' failed with exit code {exit_code}"),
                    None => "a task failed".to_string(),
                },
                resumable: true,
            },
        )?;
        store.write_run(&RunRecord {
            status: RunStatus::Failed,
            ..record.clone()
        })
    } else {
        store.write_run(&RunRecord {
            status: RunStatus::Completed,
            ..record.clone()
        })
    }
}
