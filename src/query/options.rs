//! Query options, retry policy and per-feature policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::EntryTtl;
use crate::error::QueryResult;

const DEFAULT_STALE_TIME_MS: u64 = 0;
const DEFAULT_CACHE_TIME_MS: u64 = 5 * 60 * 1000;
const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;
const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// Exponential backoff: `backoff_base * 2^attempt`, capped at `max_backoff`.
///
/// `max_attempts` counts retries after the first try, so `0` means a single
/// attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_backoff: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            max_attempts,
            backoff_base,
            max_backoff: Some(Duration::from_millis(DEFAULT_MAX_BACKOFF_MS)),
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            backoff_base: Duration::ZERO,
            max_backoff: None,
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Option<Duration>) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self.backoff_base.saturating_mul(factor);
        match self.max_backoff {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRIES, Duration::from_millis(DEFAULT_BACKOFF_BASE_MS))
    }
}

/// Numeric constants for one feature (`[features.<name>]`).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeaturePolicy {
    pub stale_time_ms: u64,
    pub cache_time_ms: u64,
    pub retries: u32,
    pub backoff_base_ms: u64,
    pub max_backoff_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

impl Default for FeaturePolicy {
    fn default() -> Self {
        Self {
            stale_time_ms: DEFAULT_STALE_TIME_MS,
            cache_time_ms: DEFAULT_CACHE_TIME_MS,
            retries: DEFAULT_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            max_backoff_ms: Some(DEFAULT_MAX_BACKOFF_MS),
            timeout_ms: None,
        }
    }
}

impl FeaturePolicy {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_millis(self.backoff_base_ms))
            .with_max_backoff(self.max_backoff_ms.map(Duration::from_millis))
    }

    pub fn cache_time(&self) -> Duration {
        Duration::from_millis(self.cache_time_ms)
    }

    /// Check the lifetimes form a valid entry TTL.
    pub fn validate(&self) -> QueryResult<()> {
        QueryOptions::from(self).validate()
    }
}

/// Per-query behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    /// After this long, cached data is served but refreshed in the background.
    pub stale_time: Duration,
    /// After this long, cached data is evicted outright.
    pub cache_time: Duration,
    pub retry: RetryPolicy,
    /// Disabled queries never fetch on their own; `refetch` still works.
    pub enabled: bool,
    /// Per-attempt timeout; a timeout counts as a failed attempt.
    pub timeout: Option<Duration>,
    /// Poll while at least one subscriber is attached.
    pub refetch_interval: Option<Duration>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_millis(DEFAULT_STALE_TIME_MS),
            cache_time: Duration::from_millis(DEFAULT_CACHE_TIME_MS),
            retry: RetryPolicy::default(),
            enabled: true,
            timeout: None,
            refetch_interval: None,
        }
    }
}

impl QueryOptions {
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    /// Entry lifetimes; a configuration error if `stale_time > cache_time`
    /// or `cache_time` is zero.
    pub fn ttl(&self) -> QueryResult<EntryTtl> {
        EntryTtl::new(self.stale_time, self.cache_time)
    }

    pub fn validate(&self) -> QueryResult<()> {
        self.ttl().map(|_| ())
    }
}

impl From<&FeaturePolicy> for QueryOptions {
    fn from(policy: &FeaturePolicy) -> Self {
        Self {
            stale_time: Duration::from_millis(policy.stale_time_ms),
            cache_time: policy.cache_time(),
            retry: policy.retry_policy(),
            enabled: true,
            timeout: policy.timeout_ms.map(Duration::from_millis),
            refetch_interval: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100))
            .with_max_backoff(Some(Duration::from_millis(500)));

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn uncapped_backoff_saturates() {
        let policy = RetryPolicy::new(1, Duration::from_secs(1)).with_max_backoff(None);
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert!(policy.delay_for(64) >= Duration::from_secs(u32::MAX as u64));
    }

    #[test]
    fn stale_time_beyond_cache_time_is_rejected() {
        let options = QueryOptions::default()
            .stale_time(Duration::from_secs(10))
            .cache_time(Duration::from_secs(5));
        assert!(options.ttl().unwrap_err().is_configuration());
    }

    #[test]
    fn options_from_feature_policy() {
        let policy = FeaturePolicy {
            stale_time_ms: 30_000,
            cache_time_ms: 600_000,
            retries: 1,
            timeout_ms: Some(2_000),
            ..Default::default()
        };

        let options = QueryOptions::from(&policy);
        assert_eq!(options.stale_time, Duration::from_secs(30));
        assert_eq!(options.cache_time, Duration::from_secs(600));
        assert_eq!(options.retry.max_attempts, 1);
        assert_eq!(options.timeout, Some(Duration::from_secs(2)));
        assert!(policy.validate().is_ok());
    }
}
