//! Artifact restoration from cache entries.
//!
//! After restoration the workspace is byte-identical to a fresh successful
//! execution. Writes are atomic (temp file in the target directory, then
//! rename); a file whose content already matches is left untouched.

use crate::cache::CacheEntry;
use crate::hash::content_hash;
use crate::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn target_path(artifact_path: &str, base_dir: &Path) -> PathBuf {
    let path = Path::new(artifact_path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Restore every artifact of `entry` into the workspace.
///
/// # Errors
///
/// Restoration is not partial-safe: any I/O failure is fatal to the
/// restore and surfaces as an error.
pub fn restore(entry: &CacheEntry, base_dir: &Path) -> Result<()> {
    let span = tracing::debug_span!(
        "replay.restore",
        hash = %entry.task_hash,
        artifacts = entry.artifacts.len()
    );
    let _guard = span.enter();

    for artifact in &entry.artifacts {
        let target = target_path(&artifact.path, base_dir);

        if let Ok(existing) = fs::read(&target) {
            if content_hash(&existing) == content_hash(&artifact.content) {
                continue;
            }
        }

        let parent = target
            .parent()
            .ok_or_else(|| Error::workspace(format!("artifact path '{}' has no parent", artifact.path)))?;
        fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;

        let nonce = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp = parent.join(format!(".gantry-restore-{}-{nonce}", std::process::id()));
        fs::write(&temp, &artifact.content).map_err(|e| Error::io(e, &temp, "write"))?;
        if let Err(e) = fs::rename(&temp, &target) {
            let _ = fs::remove_file(&temp);
            return Err(Error::io(e, &target, "rename"));
        }
    }

    Ok(())
}
