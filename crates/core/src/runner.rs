//! Single-task orchestration: resolve, hash, probe, execute or replay.

use crate::cache::{Cache, CacheEntry};
use crate::exec::{self, ExecutionContext};
use crate::normalize::Normalizer;
use crate::{Result, Task, harvest, hash, inputs, replay};

/// Result of running one task through the runner.
#[derive(Debug, Clone)]
pub struct TaskRunResult {
    /// Content-addressed task identity.
    pub hash: String,
    /// Captured (or replayed) stdout bytes.
    pub stdout: Vec<u8>,
    /// Captured (or replayed) stderr bytes.
    pub stderr: Vec<u8>,
    /// Exit status of the execution or the cached original.
    pub exit_code: i32,
    /// Whether the result came from the cache.
    pub from_cache: bool,
    /// Paths of artifacts restored into the workspace (cache path only).
    pub artifacts_restored: Vec<String>,
}

/// Runs a single task against a workspace and a cache.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    /// Cache capability used for probe and commit.
    pub cache: Cache,
    /// Normalizer applied to harvested artifact content.
    pub normalizer: Normalizer,
    /// When false the cache probe is skipped (clean mode: always a miss).
    pub read_cache: bool,
    /// When false results are not committed to the cache (clean mode).
    pub write_cache: bool,
}

impl TaskRunner {
    /// Create a runner with normal read/write cache behaviour.
    #[must_use]
    pub fn new(cache: Cache, normalizer: Normalizer) -> Self {
        Self {
            cache,
            normalizer,
            read_cache: true,
            write_cache: true,
        }
    }

    /// Create a runner that treats the cache as always-miss and discards
    /// writes.
    #[must_use]
    pub fn detached(cache: Cache, normalizer: Normalizer) -> Self {
        Self {
            cache,
            normalizer,
            read_cache: false,
            write_cache: false,
        }
    }

    /// Validate `task`, resolve its inputs, and compute its content hash.
    ///
    /// Split out of [`Self::run`] so a DAG executor can probe the cache at
    /// dispatch time, before choosing a state transition.
    pub fn resolve_hash(&self, task: &Task, ctx: &ExecutionContext) -> Result<String> {
        task.validate()?;
        let resolved = inputs::resolve(&task.inputs, &ctx.workdir)?;
        Ok(hash::task_hash(&ctx.workdir, task, &resolved))
    }

    /// Execute a task whose hash is already known to miss the cache:
    /// run the command, harvest on success, and commit the entry.
    pub async fn execute_prepared(
        &self,
        task: &Task,
        task_hash: &str,
        ctx: &ExecutionContext,
    ) -> Result<TaskRunResult> {
        let output = exec::execute(task, task_hash, ctx).await?;

        let artifacts = if output.exit_code == 0 {
            harvest::harvest(&task.outputs, &ctx.workdir, self.normalizer)?
        } else {
            Vec::new()
        };

        if self.write_cache {
            self.cache.put(&CacheEntry {
                task_hash: task_hash.to_string(),
                stdout: output.stdout.clone(),
                stderr: output.stderr.clone(),
                exit_code: output.exit_code,
                artifacts,
            })?;
        }

        Ok(TaskRunResult {
            hash: task_hash.to_string(),
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            from_cache: false,
            artifacts_restored: Vec::new(),
        })
    }

    /// Run `task`: validate, resolve inputs, hash, probe the cache, and
    /// either replay the stored entry or execute and commit a new one.
    ///
    /// A non-zero exit is cached (with an empty artifact list) and reported
    /// through `exit_code`, not as an error. Harvesting is never performed
    /// on failure.
    pub async fn run(&self, task: &Task, ctx: &ExecutionContext) -> Result<TaskRunResult> {
        let task_hash = self.resolve_hash(task, ctx)?;

        if self.read_cache {
            if let Some(entry) = self.cache.get(&task_hash)? {
                tracing::debug!(task = %task.name, hash = %task_hash, "cache hit");
                return Self::replay_entry(&entry, ctx);
            }
        }

        tracing::debug!(task = %task.name, hash = %task_hash, "cache miss, executing");
        self.execute_prepared(task, &task_hash, ctx).await
    }

    /// Restore a cache entry into the workspace and report it as this
    /// task's result.
    pub fn replay_entry(entry: &CacheEntry, ctx: &ExecutionContext) -> Result<TaskRunResult> {
        replay::restore(entry, &ctx.workdir)?;
        Ok(TaskRunResult {
            hash: entry.task_hash.clone(),
            stdout: entry.stdout.clone(),
            stderr: entry.stderr.clone(),
            exit_code: entry.exit_code,
            from_cache: true,
            artifacts_restored: entry.artifacts.iter().map(|a| a.path.clone()).collect(),
        })
    }
}
