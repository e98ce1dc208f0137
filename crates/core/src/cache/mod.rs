//! Content-addressed result cache.
//!
//! Successful and failed executions are both cached under the task hash so
//! replays are deterministic; failed entries always carry an empty artifact
//! list (partial outputs are never cached). The cache is a capability
//! passed into the runner; variants are a tagged sum, not trait objects.

mod disk;
mod memory;

pub use disk::DiskCache;
pub use memory::MemoryCache;

use crate::harvest::Artifact;
use crate::{Error, Result};

/// A cached execution result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Content-addressed task identity.
    pub task_hash: String,
    /// Captured stdout bytes.
    pub stdout: Vec<u8>,
    /// Captured stderr bytes.
    pub stderr: Vec<u8>,
    /// Child exit status.
    pub exit_code: i32,
    /// Harvested artifacts in canonical (sorted) order. Empty whenever
    /// `exit_code` is non-zero.
    pub artifacts: Vec<Artifact>,
}

impl CacheEntry {
    fn check_artifact_invariant(&self) -> Result<()> {
        if self.exit_code != 0 && !self.artifacts.is_empty() {
            return Err(Error::system(format!(
                "cache entry {} has exit code {} but {} artifacts; failed entries must be artifact-free",
                self.task_hash,
                self.exit_code,
                self.artifacts.len()
            )));
        }
        Ok(())
    }
}

/// Cache capability handed to the runner and planner.
#[derive(Debug, Clone)]
pub enum Cache {
    /// Durable cache under a content-addressed directory tree.
    Persistent(DiskCache),
    /// Process-local cache for tests.
    Memory(MemoryCache),
}

impl Cache {
    /// Whether an entry exists for `hash`.
    #[must_use]
    pub fn has(&self, hash: &str) -> bool {
        match self {
            Self::Persistent(cache) => cache.has(hash),
            Self::Memory(cache) => cache.has(hash),
        }
    }

    /// Load the entry for `hash`, or `None` when absent.
    pub fn get(&self, hash: &str) -> Result<Option<CacheEntry>> {
        match self {
            Self::Persistent(cache) => cache.get(hash),
            Self::Memory(cache) => cache.get(hash),
        }
    }

    /// Store `entry`, atomically replacing any previous entry for the same
    /// hash.
    pub fn put(&self, entry: &CacheEntry) -> Result<()> {
        entry.check_artifact_invariant()?;
        match self {
            Self::Persistent(cache) => cache.put(entry),
            Self::Memory(cache) => cache.put(entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_entry_with_artifacts_is_rejected() {
        let cache = Cache::Memory(MemoryCache::new());
        let entry = CacheEntry {
            task_hash: "deadbeef".into(),
            stdout: vec![],
            stderr: vec![],
            exit_code: 1,
            artifacts: vec![Artifact {
                path: "x".into(),
                content: vec![1],
            }],
        };
        assert!(cache.put(&entry).is_err());
    }

    #[test]
    fn failed_entry_without_artifacts_is_valid() {
        let cache = Cache::Memory(MemoryCache::new());
        let entry = CacheEntry {
            task_hash: "deadbeef".into(),
            stdout: b"out".to_vec(),
            stderr: b"err".to_vec(),
            exit_code: 7,
            artifacts: vec![],
        };
        cache.put(&entry).unwrap();
        assert_eq!(cache.get("deadbeef").unwrap().unwrap().exit_code, 7);
    }
}
