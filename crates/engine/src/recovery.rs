//! Durable run, checkpoint, and failure records with resume eligibility.
//!
//! Records live under `<workspace>/.runs/<run-id>/`. Every write is
//! temp-file + fsync + rename + directory fsync, so a crash never leaves a
//! half-written record. Reads are strict: unknown fields and trailing data
//! are rejected.

use crate::ExecutionMode;
use crate::invalidation::{GraphSnapshot, InvalidationMap};
use chrono::{DateTime, Utc};
use gantry_core::{Error, FailureClass, Result};
use gantry_task_graph::TaskGraph;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Directory name for recovery records inside the workspace.
pub const RUNS_DIR: &str = ".runs";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Final status of a run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Run record written at start; still in flight.
    Running,
    /// All tasks terminal, none failed.
    Completed,
    /// Terminated with a failure record.
    Failed,
    /// Cancelled cooperatively.
    Cancelled,
}

/// One run of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunRecord {
    /// Unique run id.
    pub run_id: String,
    /// Identity of the graph this run executed.
    pub graph_hash: String,
    /// Wall-clock start. Never part of any hash.
    pub start_time: DateTime<Utc>,
    /// Execution mode the run was invoked with.
    pub mode: ExecutionMode,
    /// 0 for fresh runs, previous + 1 for resumes.
    pub retry_count: u32,
    /// Lifecycle status.
    pub status: RunStatus,
    /// The resumed run, serialized as explicit null when absent.
    pub previous_run_id: Option<String>,
}

/// Durable proof that a node completed with specific outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointRecord {
    /// The completed node.
    pub node_id: String,
    /// When the checkpoint was written.
    pub timestamp: DateTime<Utc>,
    /// Cache keys proven to exist at checkpoint time. Never null.
    pub cache_keys: Vec<String>,
    /// Combined content hash over the node's harvested outputs.
    pub output_hash: String,
    /// Whether validation passed when the checkpoint was written.
    pub valid: bool,
}

/// Why a run terminated unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailureRecord {
    /// One of the four failure classes.
    pub failure_class: FailureClass,
    /// The failed node, when the failure is attributable to one.
    pub node_id: Option<String>,
    /// Machine-readable code.
    pub error_code: String,
    /// Human-readable message.
    pub error_message: String,
    /// Whether a later run may resume from this one.
    pub resumable: bool,
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;

    let parent = path
        .parent()
        .ok_or_else(|| Error::system(format!("record path '{}' has no parent", path.display())))?;
    fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;

    let nonce = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp = parent.join(format!(".tmp-record-{}-{nonce}", std::process::id()));
    let mut file = fs::File::create(&temp).map_err(|e| Error::io(e, &temp, "create"))?;
    file.write_all(bytes).map_err(|e| Error::io(e, &temp, "write"))?;
    file.sync_all().map_err(|e| Error::io(e, &temp, "fsync"))?;
    drop(file);

    if let Err(e) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(Error::io(e, path, "rename"));
    }

    // Directory fsync so the rename itself is durable.
    #[cfg(unix)]
    {
        let dir = fs::File::open(parent).map_err(|e| Error::io(e, parent, "open"))?;
        dir.sync_all().map_err(|e| Error::io(e, parent, "fsync"))?;
    }

    Ok(())
}

fn read_strict<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path).map_err(|e| Error::io(e, path, "read"))?;
    // serde_json rejects both unknown fields (via the derive) and trailing
    // data after the document.
    serde_json::from_slice(&raw).map_err(|e| {
        Error::workspace(format!("corrupt record '{}': {e}", path.display()))
    })
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::system(format!("failed to serialize record: {e}")))
}

/// Handle to the `.runs` store of one workspace.
#[derive(Debug, Clone)]
pub struct RecoveryStore {
    root: PathBuf,
}

impl RecoveryStore {
    /// Open (creating if needed) the store under `workspace`.
    pub fn open(workspace: &Path) -> Result<Self> {
        let root = workspace.join(RUNS_DIR);
        fs::create_dir_all(&root).map_err(|e| Error::io(e, &root, "create_dir_all"))?;
        Ok(Self { root })
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    /// Write (or atomically replace) the run record.
    pub fn write_run(&self, record: &RunRecord) -> Result<()> {
        write_atomic(&self.run_dir(&record.run_id).join("run"), &to_json(record)?)
    }

    /// Write the failure record for a run. At most one per run.
    pub fn write_failure(&self, run_id: &str, record: &FailureRecord) -> Result<()> {
        write_atomic(&self.run_dir(run_id).join("failure"), &to_json(record)?)
    }

    /// Append a checkpoint record for a node.
    pub fn write_checkpoint(&self, run_id: &str, record: &CheckpointRecord) -> Result<()> {
        write_atomic(
            &self
                .run_dir(run_id)
                .join("checkpoints")
                .join(&record.node_id),
            &to_json(record)?,
        )
    }

    /// Persist the pre-run graph snapshot used by later invalidation.
    pub fn write_snapshot(&self, run_id: &str, snapshot: &GraphSnapshot) -> Result<()> {
        write_atomic(&self.run_dir(run_id).join("snapshot"), &to_json(snapshot)?)
    }

    /// Load a run record.
    pub fn load_run(&self, run_id: &str) -> Result<RunRecord> {
        read_strict(&self.run_dir(run_id).join("run"))
    }

    /// Load the failure record, or `None` when the run has none.
    pub fn load_failure(&self, run_id: &str) -> Result<Option<FailureRecord>> {
        let path = self.run_dir(run_id).join("failure");
        if !path.is_file() {
            return Ok(None);
        }
        read_strict(&path).map(Some)
    }

    /// Load the pre-run snapshot, or `None` when absent.
    pub fn load_snapshot(&self, run_id: &str) -> Result<Option<GraphSnapshot>> {
        let path = self.run_dir(run_id).join("snapshot");
        if !path.is_file() {
            return Ok(None);
        }
        read_strict(&path).map(Some)
    }

    /// Load every checkpoint of a run, keyed by node id.
    pub fn load_checkpoints(&self, run_id: &str) -> Result<BTreeMap<String, CheckpointRecord>> {
        let dir = self.run_dir(run_id).join("checkpoints");
        let mut checkpoints = BTreeMap::new();
        if !dir.is_dir() {
            return Ok(checkpoints);
        }
        let mut names: Vec<String> = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| Error::io(e, &dir, "read_dir"))? {
            let entry = entry.map_err(|e| Error::io(e, &dir, "read_dir"))?;
            if entry.path().is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort_unstable();
        for name in names {
            if name.starts_with(".tmp-") {
                continue;
            }
            let record: CheckpointRecord = read_strict(&dir.join(&name))?;
            checkpoints.insert(record.node_id.clone(), record);
        }
        Ok(checkpoints)
    }

    /// Every run id present in the store, sorted.
    pub fn list_runs(&self) -> Result<Vec<String>> {
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| Error::io(e, &self.root, "read_dir"))? {
            let entry = entry.map_err(|e| Error::io(e, &self.root, "read_dir"))?;
            if entry.path().is_dir() {
                runs.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        runs.sort_unstable();
        Ok(runs)
    }

    /// Previous-run detection: the run with the greatest `start_time`
    /// (ties broken lexicographically on run id) whose `graph_hash`
    /// matches and whose failure record exists.
    pub fn find_previous_failed(&self, graph_hash: &str) -> Result<Option<RunRecord>> {
        let mut best: Option<RunRecord> = None;
        for run_id in self.list_runs()? {
            let Ok(record) = self.load_run(&run_id) else {
                continue;
            };
            if record.graph_hash != graph_hash {
                continue;
            }
            if self.load_failure(&run_id)?.is_none() {
                continue;
            }
            let better = best.as_ref().is_none_or(|current| {
                (record.start_time, &record.run_id) > (current.start_time, &current.run_id)
            });
            if better {
                best = Some(record);
            }
        }
        Ok(best)
    }

    /// The most recent run carrying a snapshot, used as the "old" side of
    /// invalidation for plain incremental runs.
    pub fn latest_snapshot(&self) -> Result<Option<(RunRecord, GraphSnapshot)>> {
        let mut best: Option<RunRecord> = None;
        for run_id in self.list_runs()? {
            let Ok(record) = self.load_run(&run_id) else {
                continue;
            };
            if !self.run_dir(&run_id).join("snapshot").is_file() {
                continue;
            }
            let better = best.as_ref().is_none_or(|current| {
                (record.start_time, &record.run_id) > (current.start_time, &current.run_id)
            });
            if better {
                best = Some(record);
            }
        }
        match best {
            Some(record) => {
                let snapshot = self.load_snapshot(&record.run_id)?;
                Ok(snapshot.map(|snapshot| (record, snapshot)))
            }
            None => Ok(None),
        }
    }
}

/// Everything needed to resume from a prior failed run.
#[derive(Debug, Clone)]
pub struct ResumeContext {
    /// The failed run being resumed.
    pub previous: RunRecord,
    /// Its failure record.
    pub failure: FailureRecord,
    /// Its checkpoints by node id.
    pub checkpoints: BTreeMap<String, CheckpointRecord>,
    /// Its pre-run snapshot.
    pub snapshot: GraphSnapshot,
}

/// Check the full resume eligibility conjunction.
///
/// # Errors
///
/// Returns a workspace-class error naming the first violated condition.
pub fn check_resume_eligibility(
    mode: ExecutionMode,
    graph: &TaskGraph,
    context: &ResumeContext,
    invalidation: &InvalidationMap,
) -> Result<()> {
    if mode == ExecutionMode::Clean {
        return Err(Error::workspace("clean runs cannot resume"));
    }
    if !context.failure.resumable {
        return Err(Error::workspace(format!(
            "previous run {} is not resumable ({})",
            context.previous.run_id, context.failure.error_code
        )));
    }
    if context.previous.graph_hash != graph.graph_hash() {
        return Err(Error::workspace(format!(
            "graph hash changed since run {} ({} != {})",
            context.previous.run_id,
            context.previous.graph_hash,
            graph.graph_hash()
        )));
    }

    // No node in the transitive upstream closure of any resume checkpoint
    // may be invalidated.
    for checkpoint in context.checkpoints.values().filter(|c| c.valid) {
        let Some(index) = graph.index_of(&checkpoint.node_id) else {
            continue;
        };
        let mut closure = graph.ancestors(index);
        closure.insert(index);
        for node in closure {
            let name = &graph.node(node).name;
            if invalidation.get(name).is_some_and(|entry| entry.invalidated) {
                return Err(Error::workspace(format!(
                    "task '{name}' upstream of checkpoint '{}' is invalidated; resume rejected",
                    checkpoint.node_id
                )));
            }
        }
    }

    Ok(())
}
