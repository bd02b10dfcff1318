//! Cache store
//!
//! The single owner of cached values. Everything else in the engine holds
//! keys and descriptors and reacts to this store's change events.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! max_entries = 500
//! sweep_interval_ms = 60000
//! default_stale_time_ms = 0
//! default_cache_time_ms = 300000
//! ```

mod config;
mod entry;
mod events;
mod key;
mod listeners;
mod lock;
mod store;

pub use config::CacheConfig;
pub use entry::{CacheEntry, EntryTtl};
pub use events::{ChangeEvent, ChangeKind, Epoch};
pub use key::{KeyPattern, QueryKey, SEGMENT_DELIMITER};
pub use listeners::{ChangeCallback, ListenerId};
pub use store::{CacheStats, CacheStore};

pub(crate) use lock::{mutex_lock, read_lock, write_lock};
pub(crate) use store::{
    METRIC_CACHE_ENTRIES, METRIC_CACHE_EVICT, METRIC_CACHE_EXPIRED, METRIC_CACHE_HIT,
    METRIC_CACHE_MISS,
};
