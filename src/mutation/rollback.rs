use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;

use crate::cache::{CacheEntry, CacheStore, QueryKey};

/// A single speculative cache write.
#[derive(Debug, Clone, PartialEq)]
pub enum CachePatch {
    Set { key: QueryKey, value: Value },
    Delete { key: QueryKey },
}

impl CachePatch {
    pub fn set(key: QueryKey, value: Value) -> Self {
        Self::Set { key, value }
    }

    pub fn delete(key: QueryKey) -> Self {
        Self::Delete { key }
    }

    pub fn key(&self) -> &QueryKey {
        match self {
            Self::Set { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// How to undo an optimistic update.
#[derive(Clone)]
pub enum Rollback {
    /// Entries exactly as they were before the patch; `None` means absent.
    ///
    /// Also covers entries the patch pushed out at capacity, and the LRU order
    /// at capture time.
    PreviousValue {
        entries: Vec<(QueryKey, Option<CacheEntry>)>,
        recency: Vec<(QueryKey, Instant)>,
    },
    /// Caller-supplied inverse.
    RollbackFn(Arc<dyn Fn(&CacheStore) + Send + Sync>),
}

impl Rollback {
    /// Snapshot `keys` as they are stored right now.
    pub fn capture<'a>(cache: &CacheStore, keys: impl IntoIterator<Item = &'a QueryKey>) -> Self {
        let mut entries: Vec<(QueryKey, Option<CacheEntry>)> = Vec::new();
        for key in keys {
            if entries.iter().any(|(captured, _)| captured == key) {
                continue;
            }
            entries.push((key.clone(), cache.snapshot_entry(key)));
        }
        Self::PreviousValue {
            entries,
            recency: cache.recency(),
        }
    }

    /// Remember an entry evicted while the patch was applied.
    ///
    /// Keys already captured keep their earlier snapshot.
    pub fn record_evicted(&mut self, evicted: CacheEntry) {
        if let Self::PreviousValue { entries, .. } = self
            && !entries.iter().any(|(captured, _)| *captured == evicted.key)
        {
            entries.push((evicted.key.clone(), Some(evicted)));
        }
    }

    pub fn function<F>(rollback: F) -> Self
    where
        F: Fn(&CacheStore) + Send + Sync + 'static,
    {
        Self::RollbackFn(Arc::new(rollback))
    }

    pub fn apply(&self, cache: &CacheStore) {
        match self {
            Self::PreviousValue { entries, recency } => {
                // Removals first so restored entries never evict each other.
                let (absent, present): (Vec<_>, Vec<_>) =
                    entries.iter().partition(|(_, snapshot)| snapshot.is_none());
                for (key, snapshot) in absent.into_iter().chain(present) {
                    cache.restore(key, snapshot.clone());
                }
                cache.restore_recency(recency);
            }
            Self::RollbackFn(rollback) => rollback(cache),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::PreviousValue { .. } => "previous_value",
            Self::RollbackFn(_) => "rollback_fn",
        }
    }
}

impl fmt::Debug for Rollback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreviousValue { entries, .. } => f
                .debug_struct("PreviousValue")
                .field("entries", entries)
                .finish_non_exhaustive(),
            Self::RollbackFn(_) => f.write_str("RollbackFn(..)"),
        }
    }
}

/// Output of a descriptor's optimistic function.
#[derive(Debug, Clone, Default)]
pub struct OptimisticUpdate {
    pub patches: Vec<CachePatch>,
    /// When absent, the previous values of every patched key are captured.
    pub rollback: Option<Rollback>,
}

impl OptimisticUpdate {
    pub fn new(patches: Vec<CachePatch>) -> Self {
        Self {
            patches,
            rollback: None,
        }
    }

    pub fn with_rollback(mut self, rollback: Rollback) -> Self {
        self.rollback = Some(rollback);
        self
    }

    /// Patched keys, sorted and de-duplicated.
    pub fn keys(&self) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = self.patches.iter().map(|patch| patch.key().clone()).collect();
        keys.sort();
        keys.dedup();
        keys
    }
}
