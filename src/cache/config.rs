//! Cache configuration.
//!
//! Controls the capacity, sweep cadence and default lifetimes of the cache
//! store via the `[cache]` section of `reactive-query.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// Default values for cache configuration
const DEFAULT_MAX_ENTRIES: usize = 500;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;
const DEFAULT_STALE_TIME_MS: u64 = 0;
const DEFAULT_CACHE_TIME_MS: u64 = 5 * 60 * 1000;

/// Cache configuration from `reactive-query.toml`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum live entries before LRU eviction kicks in.
    pub max_entries: usize,
    /// Interval (ms) of the background expiry sweep. Zero disables the sweeper.
    pub sweep_interval_ms: u64,
    /// Stale time (ms) applied by `CacheStore::set` callers that pass no policy.
    pub default_stale_time_ms: u64,
    /// Cache time (ms) applied when no feature policy matches.
    pub default_cache_time_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            default_stale_time_ms: DEFAULT_STALE_TIME_MS,
            default_cache_time_ms: DEFAULT_CACHE_TIME_MS,
        }
    }
}

impl CacheConfig {
    /// Returns the capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the sweep interval, or `None` when sweeping is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }

    pub fn default_stale_time(&self) -> Duration {
        Duration::from_millis(self.default_stale_time_ms)
    }

    pub fn default_cache_time(&self) -> Duration {
        Duration::from_millis(self.default_cache_time_ms)
    }
}
