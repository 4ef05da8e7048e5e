//! In-memory query cache

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{QueryCache, QueryKey};

#[derive(Debug, Clone)]
struct CachedResult {
    value: serde_json::Value,
    stale: bool,
}

/// Query results kept in memory, with an invalidation log
#[derive(Debug, Default)]
pub struct MemoryQueryCache {
    entries: RwLock<HashMap<QueryKey, CachedResult>>,
    invalidations: RwLock<Vec<QueryKey>>,
}

impl MemoryQueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fresh result
    pub fn put(&self, key: QueryKey, value: serde_json::Value) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, CachedResult { value, stale: false });
    }

    pub fn get(&self, key: &QueryKey) -> Option<serde_json::Value> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|entry| entry.value.clone())
    }

    /// Whether a stored result needs refetching; unknown keys count as stale
    pub fn is_stale(&self, key: &QueryKey) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|entry| entry.stale)
            .unwrap_or(true)
    }

    /// Every key invalidated so far, in order
    pub fn invalidations(&self) -> Vec<QueryKey> {
        self.invalidations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl QueryCache for MemoryQueryCache {
    async fn invalidate(&self, key: &QueryKey) {
        let mut marked = 0;
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            for (cached_key, entry) in entries.iter_mut() {
                if cached_key.starts_with(key) {
                    entry.stale = true;
                    marked += 1;
                }
            }
        }
        self.invalidations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(key.clone());

        tracing::debug!(key = %key, marked, "Invalidated cached queries");
    }
}
