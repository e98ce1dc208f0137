//! Durable cache entries under a content-addressed directory tree.
//!
//! Layout: `<root>/<hash[0:2]>/<hash>/` holding `metadata` (stdout, stderr,
//! exit code, artifact path list) and `artifacts/<i>.blob`, one blob per
//! artifact in canonical order. Commits are atomic: everything is written
//! into a sibling temporary directory which is renamed into place, so a
//! crash mid-commit yields a miss, never a corrupt entry.

use super::CacheEntry;
use crate::harvest::Artifact;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Metadata {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: i32,
    artifact_paths: Vec<String>,
}

/// Cache rooted at a directory on disk.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    /// Create a cache over `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::io(e, &root, "create_dir_all"))?;
        Ok(Self { root })
    }

    fn entry_dir(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[0..2]).join(hash)
    }

    pub(super) fn has(&self, hash: &str) -> bool {
        if hash.len() < 2 {
            return false;
        }
        self.entry_dir(hash).join("metadata").is_file()
    }

    pub(super) fn get(&self, hash: &str) -> Result<Option<CacheEntry>> {
        if hash.len() < 2 {
            return Ok(None);
        }
        let dir = self.entry_dir(hash);
        let meta_path = dir.join("metadata");
        let raw = match fs::read(&meta_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(e, &meta_path, "read")),
        };
        let metadata: Metadata = serde_json::from_slice(&raw)
            .map_err(|e| Error::workspace(format!("corrupt cache metadata for {hash}: {e}")))?;

        let mut artifacts = Vec::with_capacity(metadata.artifact_paths.len());
        for (index, path) in metadata.artifact_paths.iter().enumerate() {
            let blob_path = dir.join("artifacts").join(format!("{index}.blob"));
            let content = fs::read(&blob_path).map_err(|e| Error::io(e, &blob_path, "read"))?;
            artifacts.push(Artifact {
                path: path.clone(),
                content,
            });
        }

        Ok(Some(CacheEntry {
            task_hash: hash.to_string(),
            stdout: metadata.stdout,
            stderr: metadata.stderr,
            exit_code: metadata.exit_code,
            artifacts,
        }))
    }

    pub(super) fn put(&self, entry: &CacheEntry) -> Result<()> {
        if entry.task_hash.len() < 2 {
            return Err(Error::system(format!(
                "cache hash too short: '{}'",
                entry.task_hash
            )));
        }
        let shard = self.root.join(&entry.task_hash[0..2]);
        fs::create_dir_all(&shard).map_err(|e| Error::io(e, &shard, "create_dir_all"))?;

        // Sibling temp dir so the final rename stays within one filesystem.
        let nonce = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp = shard.join(format!(
            ".tmp-{}-{}-{nonce}",
            &entry.task_hash,
            std::process::id()
        ));
        let result = self.write_entry(&temp, entry);
        if result.is_err() {
            let _ = fs::remove_dir_all(&temp);
        }
        result
    }

    fn write_entry(&self, temp: &Path, entry: &CacheEntry) -> Result<()> {
        let artifacts_dir = temp.join("artifacts");
        fs::create_dir_all(&artifacts_dir)
            .map_err(|e| Error::io(e, &artifacts_dir, "create_dir_all"))?;

        for (index, artifact) in entry.artifacts.iter().enumerate() {
            let blob_path = artifacts_dir.join(format!("{index}.blob"));
            fs::write(&blob_path, &artifact.content)
                .map_err(|e| Error::io(e, &blob_path, "write"))?;
        }

        let metadata = Metadata {
            stdout: entry.stdout.clone(),
            stderr: entry.stderr.clone(),
            exit_code: entry.exit_code,
            artifact_paths: entry.artifacts.iter().map(|a| a.path.clone()).collect(),
        };
        let json = serde_json::to_vec(&metadata)
            .map_err(|e| Error::system(format!("failed to serialize cache metadata: {e}")))?;
        let meta_path = temp.join("metadata");
        fs::write(&meta_path, json).map_err(|e| Error::io(e, &meta_path, "write"))?;

        // Best-effort removal of the previous entry, then rename into place.
        // A concurrent writer for the same hash is legal; whoever renames
        // last wins, and both wrote identical content.
        let final_dir = self.entry_dir(&entry.task_hash);
        let _ = fs::remove_dir_all(&final_dir);
        match fs::rename(temp, &final_dir) {
            Ok(()) => Ok(()),
            Err(_) if final_dir.join("metadata").is_file() => {
                let _ = fs::remove_dir_all(temp);
                Ok(())
            }
            Err(e) => Err(Error::io(e, &final_dir, "rename")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(hash: &str, exit: i32, artifacts: Vec<Artifact>) -> CacheEntry {
        CacheEntry {
            task_hash: hash.into(),
            stdout: b"stdout".to_vec(),
            stderr: b"stderr".to_vec(),
            exit_code: exit,
            artifacts,
        }
    }

    #[test]
    fn put_then_get_roundtrips() {
        let tmp = TempDir::new().unwrap();
        let cache = DiskCache::new(tmp.path()).unwrap();
        let stored = entry(
            "ab1234",
            0,
            vec![
                Artifact { path: "out/a.txt".into(), content: b"a".to_vec() },
                Artifact { path: "out/b.txt".into(), content: b"b".to_vec() },
            ],
        );
        cache.put(&stored).unwrap();

        assert!(cache.has("ab1234"));
        let loaded = cache.get("ab1234").unwrap().unwrap();
        assert_eq!(loaded, stored);
    }

    #[test]
    fn absent_entry_is_none_not_error() {
        let tmp = TempDir::new().unwrap();
        let cache = DiskCache::new(tmp.path()).unwrap();
        assert!(!cache.has("ffff00"));
        assert!(cache.get("ffff00").unwrap().is_none());
    }

    #[test]
    fn layout_matches_contract() {
        let tmp = TempDir::new().unwrap();
        let cache = DiskCache::new(tmp.path()).unwrap();
        cache
            .put(&entry(
                "cd5678",
                0,
                vec![Artifact { path: "x".into(), content: b"x".to_vec() }],
            ))
            .unwrap();
        let dir = tmp.path().join("cd").join("cd5678");
        assert!(dir.join("metadata").is_file());
        assert!(dir.join("artifacts/0.blob").is_file());
    }

    #[test]
    fn overwrite_is_atomic_replacement() {
        let tmp = TempDir::new().unwrap();
        let cache = DiskCache::new(tmp.path()).unwrap();
        cache
            .put(&entry(
                "ee9900",
                0,
                vec![Artifact { path: "a".into(), content: b"v1".to_vec() }],
            ))
            .unwrap();
        cache.put(&entry("ee9900", 3, vec![])).unwrap();
        let loaded = cache.get("ee9900").unwrap().unwrap();
        assert_eq!(loaded.exit_code, 3);
        assert!(loaded.artifacts.is_empty());
        // The old blob directory is gone with the old entry.
        assert!(!tmp.path().join("ee/ee9900/artifacts/0.blob").exists());
    }

    #[test]
    fn corrupt_metadata_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let cache = DiskCache::new(tmp.path()).unwrap();
        let dir = tmp.path().join("aa/aabbcc");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("metadata"), b"not json").unwrap();
        assert!(cache.get("aabbcc").is_err());
    }
}
