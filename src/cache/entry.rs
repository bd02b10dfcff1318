//! Cache entries and their lifetimes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use super::key::QueryKey;
use crate::error::{QueryError, QueryResult};

/// Stale and cache lifetimes of an entry.
///
/// `stale` must not exceed `cache`, and `cache` must be non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryTtl {
    stale: Duration,
    cache: Duration,
}

impl EntryTtl {
    pub fn new(stale: Duration, cache: Duration) -> QueryResult<Self> {
        if cache.is_zero() {
            return Err(QueryError::invalid_ttl("cache time must be greater than zero"));
        }
        if stale > cache {
            return Err(QueryError::invalid_ttl(format!(
                "stale time {stale:?} exceeds cache time {cache:?}"
            )));
        }
        Ok(Self { stale, cache })
    }

    /// Entry that is fresh for its whole lifetime.
    pub fn fixed(ttl: Duration) -> QueryResult<Self> {
        Self::new(ttl, ttl)
    }

    pub fn stale(&self) -> Duration {
        self.stale
    }

    pub fn cache(&self) -> Duration {
        self.cache
    }
}

/// A stored value together with its bookkeeping timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub value: Arc<Value>,
    pub inserted_at: Instant,
    pub last_accessed_at: Instant,
    pub stale_at: Instant,
    pub expires_at: Instant,
    /// Store-wide write counter value at insertion.
    pub generation: u64,
}

impl CacheEntry {
    pub(crate) fn new(
        key: QueryKey,
        value: Arc<Value>,
        ttl: EntryTtl,
        now: Instant,
        generation: u64,
    ) -> Self {
        Self {
            key,
            value,
            inserted_at: now,
            last_accessed_at: now,
            stale_at: now + ttl.stale(),
            expires_at: now + ttl.cache(),
            generation,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now >= self.stale_at
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inserted_at)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ttl_validation() {
        assert!(EntryTtl::new(Duration::from_secs(1), Duration::from_secs(2)).is_ok());
        assert!(EntryTtl::new(Duration::from_secs(3), Duration::from_secs(2)).is_err());
        assert!(EntryTtl::fixed(Duration::ZERO).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_before_expired() {
        let ttl = EntryTtl::new(Duration::from_millis(100), Duration::from_millis(1000)).unwrap();
        let now = Instant::now();
        let entry = CacheEntry::new(QueryKey::new("k").unwrap(), Arc::new(json!(1)), ttl, now, 0);

        assert!(entry.stale_at <= entry.expires_at);
        assert!(!entry.is_stale(now));
        assert!(entry.is_stale(now + Duration::from_millis(100)));
        assert!(!entry.is_expired(now + Duration::from_millis(1000)));
        assert!(entry.is_expired(now + Duration::from_millis(1001)));
    }
}
