//! Process-local cache for tests.

use super::CacheEntry;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// In-memory cache keyed by task hash.
///
/// Entries are deep-copied on both `put` and `get` so callers can never
/// mutate stored state through a retained reference.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl MemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn has(&self, hash: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(hash))
            .unwrap_or(false)
    }

    pub(super) fn get(&self, hash: &str) -> Result<Option<CacheEntry>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| Error::system("memory cache lock poisoned"))?;
        Ok(entries.get(hash).cloned())
    }

    pub(super) fn put(&self, entry: &CacheEntry) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::system("memory cache lock poisoned"))?;
        entries.insert(entry.task_hash.clone(), entry.clone());
        Ok(())
    }
}
