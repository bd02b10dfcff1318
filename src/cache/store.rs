//! Cache store.
//!
//! Capacity-bounded LRU map with per-entry TTL, lazy expiry, an optional
//! background sweep, pattern invalidation and change listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use lru::LruCache;
use metrics::{counter, gauge};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::config::CacheConfig;
use super::entry::{CacheEntry, EntryTtl};
use super::events::{ChangeEvent, ChangeKind, EpochCounter};
use super::key::{KeyPattern, QueryKey};
use super::listeners::{ChangeCallback, ListenerId, ListenerRegistry};
use super::lock::{mutex_lock, read_lock, write_lock};
use crate::error::QueryResult;

const SOURCE: &str = "cache::store";

pub(crate) const METRIC_CACHE_HIT: &str = "reactive_query_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "reactive_query_cache_miss_total";
pub(crate) const METRIC_CACHE_EVICT: &str = "reactive_query_cache_evict_total";
pub(crate) const METRIC_CACHE_EXPIRED: &str = "reactive_query_cache_expired_total";
pub(crate) const METRIC_CACHE_ENTRIES: &str = "reactive_query_cache_entries";

/// Counters reported by `CacheStore::stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// The single shared mutable resource of the engine.
///
/// All writes funnel through `set`, `delete`, `invalidate_pattern` (and the
/// rollback helpers); each is atomic with respect to other callers and
/// notifies listeners only after the entry lock has been released.
pub struct CacheStore {
    config: CacheConfig,
    entries: RwLock<LruCache<QueryKey, CacheEntry>>,
    listeners: ListenerRegistry,
    epochs: EpochCounter,
    generation: AtomicU64,
    stats: StatCounters,
    sweeper: Mutex<Option<AbortHandle>>,
}

impl CacheStore {
    /// Create a new store with the given configuration.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(config.max_entries_non_zero())),
            config,
            listeners: ListenerRegistry::new(),
            epochs: EpochCounter::new(),
            generation: AtomicU64::new(1),
            stats: StatCounters::default(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Default lifetimes from the store configuration, clamped so the stale
    /// time never exceeds the cache time.
    pub fn default_ttl(&self) -> QueryResult<EntryTtl> {
        let cache = self.config.default_cache_time();
        EntryTtl::new(self.config.default_stale_time().min(cache), cache)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Return the value if present and not expired, touching it for LRU.
    ///
    /// Never triggers a fetch; absence is `None`.
    pub fn get(&self, key: &QueryKey) -> Option<Arc<Value>> {
        let now = Instant::now();
        let mut events = Vec::new();
        let value = {
            let mut entries = write_lock(&self.entries, SOURCE, "get");
            if entries.peek(key).is_some_and(|entry| entry.is_expired(now)) {
                entries.pop(key);
                publish_size(entries.len());
                events.push(self.epochs.event(key.clone(), ChangeKind::Expired));
            }
            entries.get_mut(key).map(|entry| {
                entry.last_accessed_at = now;
                Arc::clone(&entry.value)
            })
        };

        if value.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_CACHE_HIT).increment(1);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_CACHE_MISS).increment(1);
        }
        self.record_expirations(&events);
        self.listeners.dispatch(&events);
        value
    }

    /// Deserialize the cached value into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
        let value = self.get(key)?;
        match T::deserialize(value.as_ref()) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!(key = %key, error = %err, "Cached value does not match requested type");
                None
            }
        }
    }

    /// Read without touching LRU order or statistics.
    pub fn peek(&self, key: &QueryKey) -> Option<Arc<Value>> {
        let now = Instant::now();
        read_lock(&self.entries, SOURCE, "peek")
            .peek(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| Arc::clone(&entry.value))
    }

    /// Entry metadata (timestamps and generation) for a live key.
    pub fn entry(&self, key: &QueryKey) -> Option<CacheEntry> {
        let now = Instant::now();
        read_lock(&self.entries, SOURCE, "entry")
            .peek(key)
            .filter(|entry| !entry.is_expired(now))
            .cloned()
    }

    /// Whether a live entry exists and is past its stale time.
    pub fn is_stale(&self, key: &QueryKey) -> Option<bool> {
        let now = Instant::now();
        self.entry(key).map(|entry| entry.is_stale(now))
    }

    /// Non-reactive accessor that warns about data older than `max_age`.
    ///
    /// Expired entries are never returned, so the warning only fires when
    /// `max_age` is shorter than the entry's own cache time. Does not touch
    /// LRU order; never fails.
    pub fn read_untracked(&self, key: &QueryKey, max_age: Duration) -> Option<Arc<Value>> {
        let entry = self.entry(key)?;
        let age = entry.age(Instant::now());
        if age > max_age {
            warn!(
                key = %key,
                age_ms = age.as_millis() as u64,
                max_age_ms = max_age.as_millis() as u64,
                warning = "StaleDataWarning",
                "Read cached data older than its cache time"
            );
        }
        Some(entry.value)
    }

    /// Keys of all live entries, most recently used first.
    pub fn keys(&self) -> Vec<QueryKey> {
        let now = Instant::now();
        read_lock(&self.entries, SOURCE, "keys")
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        read_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert or overwrite an entry that stays fresh for `ttl`.
    pub fn set(&self, key: QueryKey, value: Value, ttl: Duration) -> QueryResult<u64> {
        let ttl = EntryTtl::fixed(ttl)?;
        Ok(self.set_with(key, Arc::new(value), ttl))
    }

    /// Insert or overwrite an entry with separate stale and cache times.
    ///
    /// Returns the generation stamped on the new entry.
    pub fn set_with(&self, key: QueryKey, value: Arc<Value>, ttl: EntryTtl) -> u64 {
        self.set_evicting(key, value, ttl).0
    }

    /// Like `set_with`, also returning the live entry pushed out to make room.
    pub fn set_evicting(
        &self,
        key: QueryKey,
        value: Arc<Value>,
        ttl: EntryTtl,
    ) -> (u64, Option<CacheEntry>) {
        let now = Instant::now();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let entry = CacheEntry::new(key.clone(), value, ttl, now, generation);
        let evicted = self.insert_entry(entry, now);
        (generation, evicted)
    }

    fn insert_entry(&self, entry: CacheEntry, now: Instant) -> Option<CacheEntry> {
        let key = entry.key.clone();
        let mut events = self.purge_expired(now);
        let evicted = {
            let mut entries = write_lock(&self.entries, SOURCE, "set");
            let evicted = entries
                .push(key.clone(), entry)
                .filter(|(evicted_key, _)| *evicted_key != key)
                .map(|(_, evicted)| evicted);
            publish_size(entries.len());
            evicted
        };

        if let Some(evicted) = &evicted {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_CACHE_EVICT).increment(1);
            debug!(key = %evicted.key, "Evicted least recently used entry");
            events.push(self.epochs.event(evicted.key.clone(), ChangeKind::Evicted));
        }
        events.push(self.epochs.event(key, ChangeKind::Set));
        self.listeners.dispatch(&events);
        evicted
    }

    /// Remove an entry. Returns false if nothing was stored.
    pub fn delete(&self, key: &QueryKey) -> bool {
        let removed = {
            let mut entries = write_lock(&self.entries, SOURCE, "delete");
            let removed = entries.pop(key).is_some();
            publish_size(entries.len());
            removed
        };
        if removed {
            let event = self.epochs.event(key.clone(), ChangeKind::Deleted);
            self.listeners.dispatch(&[event]);
        }
        removed
    }

    /// Remove all live entries matching `pattern` and notify their listeners.
    ///
    /// An invalid pattern is a configuration error raised before anything is
    /// removed.
    pub fn invalidate_pattern(&self, pattern: &str) -> QueryResult<usize> {
        let pattern = KeyPattern::parse(pattern)?;
        Ok(self.invalidate_matching(&pattern))
    }

    pub fn invalidate_matching(&self, pattern: &KeyPattern) -> usize {
        let now = Instant::now();
        let mut events = self.purge_expired(now);
        let removed: Vec<QueryKey> = {
            let mut entries = write_lock(&self.entries, SOURCE, "invalidate_matching");
            let matching: Vec<QueryKey> = entries
                .iter()
                .filter(|(key, _)| pattern.matches(key.as_str()))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &matching {
                entries.pop(key);
            }
            publish_size(entries.len());
            matching
        };

        info!(pattern = %pattern, removed = removed.len(), "Cache entries invalidated");
        let count = removed.len();
        events.extend(
            removed
                .into_iter()
                .map(|key| self.epochs.event(key, ChangeKind::Invalidated)),
        );
        self.listeners.dispatch(&events);
        count
    }

    /// Make matching entries stale without removing them.
    pub fn mark_stale(&self, pattern: &KeyPattern) -> usize {
        let now = Instant::now();
        let touched: Vec<QueryKey> = {
            let mut entries = write_lock(&self.entries, SOURCE, "mark_stale");
            entries
                .iter_mut()
                .filter(|(key, entry)| pattern.matches(key.as_str()) && !entry.is_expired(now))
                .map(|(key, entry)| {
                    entry.stale_at = now.min(entry.expires_at);
                    key.clone()
                })
                .collect()
        };

        let count = touched.len();
        let events: Vec<ChangeEvent> = touched
            .into_iter()
            .map(|key| self.epochs.event(key, ChangeKind::MarkedStale))
            .collect();
        self.listeners.dispatch(&events);
        count
    }

    /// Capture an entry exactly as stored, for later `restore`.
    pub fn snapshot_entry(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.entry(key)
    }

    /// Put a captured entry back (or remove the key when it was absent).
    ///
    /// Value and timestamps are restored verbatim; only the generation is new.
    /// The entry lands at the most recently used end; see `restore_recency`.
    pub fn restore(&self, key: &QueryKey, snapshot: Option<CacheEntry>) {
        match snapshot {
            Some(mut entry) => {
                entry.key = key.clone();
                entry.generation = self.generation.fetch_add(1, Ordering::SeqCst);
                self.insert_entry(entry, Instant::now());
            }
            None => {
                self.delete(key);
            }
        }
    }

    /// Live keys with their last access time, least recently used first.
    pub fn recency(&self) -> Vec<(QueryKey, Instant)> {
        let now = Instant::now();
        read_lock(&self.entries, SOURCE, "recency")
            .iter()
            .rev()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| (key.clone(), entry.last_accessed_at))
            .collect()
    }

    /// Reinstate an LRU order captured by `recency`.
    ///
    /// Entries not accessed since the capture are put back in their captured
    /// order. Entries touched or inserted afterwards stay more recent than all
    /// of them, keeping their current relative order.
    pub fn restore_recency(&self, order: &[(QueryKey, Instant)]) {
        let mut entries = write_lock(&self.entries, SOURCE, "restore_recency");
        let mut untouched: Vec<&QueryKey> = Vec::with_capacity(order.len());
        for (key, accessed_at) in order {
            if entries
                .peek(key)
                .is_some_and(|entry| entry.last_accessed_at == *accessed_at)
            {
                untouched.push(key);
            }
        }
        let touched: Vec<QueryKey> = entries
            .iter()
            .rev()
            .filter(|(key, _)| !untouched.contains(key))
            .map(|(key, _)| key.clone())
            .collect();

        for key in untouched {
            entries.promote(key);
        }
        for key in &touched {
            entries.promote(key);
        }
    }

    /// Current generation of a live entry.
    pub fn generation_of(&self, key: &QueryKey) -> Option<u64> {
        self.entry(key).map(|entry| entry.generation)
    }

    /// Remove every entry without notifying listeners.
    pub fn clear(&self) {
        write_lock(&self.entries, SOURCE, "clear").clear();
        publish_size(0);
    }

    // ========================================================================
    // Expiry
    // ========================================================================

    /// Purge expired entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let events = self.purge_expired(Instant::now());
        let count = events.len();
        self.listeners.dispatch(&events);
        count
    }

    fn purge_expired(&self, now: Instant) -> Vec<ChangeEvent> {
        let expired: Vec<QueryKey> = {
            let mut entries = write_lock(&self.entries, SOURCE, "purge_expired");
            let expired: Vec<QueryKey> = entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                entries.pop(key);
            }
            if !expired.is_empty() {
                publish_size(entries.len());
            }
            expired
        };

        let events: Vec<ChangeEvent> = expired
            .into_iter()
            .map(|key| self.epochs.event(key, ChangeKind::Expired))
            .collect();
        self.record_expirations(&events);
        events
    }

    fn record_expirations(&self, events: &[ChangeEvent]) {
        if events.is_empty() {
            return;
        }
        let count = events.len() as u64;
        self.stats.expirations.fetch_add(count, Ordering::Relaxed);
        counter!(METRIC_CACHE_EXPIRED).increment(count);
    }

    /// Start the periodic expiry sweep on the current tokio runtime.
    ///
    /// No-op when the interval is zero or a sweeper is already running. The
    /// task holds only a weak reference and stops once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let Some(period) = self.config.sweep_interval() else {
            return;
        };
        let mut slot = mutex_lock(&self.sweeper, SOURCE, "spawn_sweeper");
        if slot.is_some() {
            return;
        }

        let store: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.sweep();
                if purged > 0 {
                    debug!(purged, "Expiry sweep removed entries");
                }
            }
        });
        *slot = Some(handle.abort_handle());
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Register a callback for sets and removals of keys matching `pattern`.
    pub fn on_change<F>(&self, pattern: KeyPattern, callback: F) -> ListenerId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let callback: ChangeCallback = Arc::new(callback);
        self.listeners.register(pattern, callback)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.listener_count()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expirations: self.stats.expirations.load(Ordering::Relaxed),
            size: self.len(),
        }
    }

    /// Stop the sweeper, drop every listener and entry.
    pub fn dispose(&self) {
        if let Some(handle) = mutex_lock(&self.sweeper, SOURCE, "dispose").take() {
            handle.abort();
        }
        self.listeners.clear();
        self.clear();
        info!("Cache store disposed");
    }
}

fn publish_size(len: usize) {
    gauge!(METRIC_CACHE_ENTRIES).set(len as f64);
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        if let Some(handle) = mutex_lock(&self.sweeper, SOURCE, "drop").take() {
            handle.abort();
        }
    }
}
