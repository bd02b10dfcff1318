//! Global query state.
//!
//! Aggregates in-flight fetches, mutations and errors across the engine for
//! cross-cutting consumers (global spinners, error banners). Only the
//! coordinators write here; consumers read snapshots or subscribe.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;

use crate::cache::QueryKey;
use crate::error::QueryError;

/// Error recorded against a query key or mutation name.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedError {
    pub error: QueryError,
    pub recorded_at: OffsetDateTime,
    sequence: u64,
}

/// Engine-wide counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryMetrics {
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub failures: u64,
    pub total_fetch_time: Duration,
}

impl QueryMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn average_fetch_time(&self) -> Option<Duration> {
        u32::try_from(self.fetches)
            .ok()
            .filter(|fetches| *fetches > 0)
            .map(|fetches| self.total_fetch_time / fetches)
    }
}

/// Snapshot of everything the tracker knows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalQueryState {
    pub loading_keys: BTreeSet<QueryKey>,
    pub errors_by_key: BTreeMap<String, TrackedError>,
    pub pending_mutations: usize,
    pub metrics: QueryMetrics,
}

impl GlobalQueryState {
    /// True iff at least one fetch is in flight.
    pub fn is_fetching(&self) -> bool {
        !self.loading_keys.is_empty()
    }

    pub fn is_mutating(&self) -> bool {
        self.pending_mutations > 0
    }

    /// The most recently recorded error that is still present.
    pub fn global_error(&self) -> Option<(&str, &QueryError)> {
        self.errors_by_key
            .iter()
            .max_by_key(|(_, tracked)| tracked.sequence)
            .map(|(key, tracked)| (key.as_str(), &tracked.error))
    }
}

/// Pure aggregator written by the coordinators.
///
/// Updates are applied synchronously, so they are visible before the
/// coordinator's own future resolves.
pub struct GlobalStateTracker {
    state: watch::Sender<GlobalQueryState>,
    sequence: AtomicU64,
}

impl GlobalStateTracker {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GlobalQueryState::default());
        Self {
            state,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> GlobalQueryState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<GlobalQueryState> {
        self.state.subscribe()
    }

    pub fn is_fetching(&self) -> bool {
        self.state.borrow().is_fetching()
    }

    pub fn is_mutating(&self) -> bool {
        self.state.borrow().is_mutating()
    }

    pub fn global_error(&self) -> Option<(String, QueryError)> {
        self.state
            .borrow()
            .global_error()
            .map(|(key, error)| (key.to_string(), error.clone()))
    }

    pub fn error_for(&self, key: &str) -> Option<QueryError> {
        self.state
            .borrow()
            .errors_by_key
            .get(key)
            .map(|tracked| tracked.error.clone())
    }

    pub(crate) fn begin_fetch(&self, key: &QueryKey) {
        self.state.send_if_modified(|state| state.loading_keys.insert(key.clone()));
    }

    pub(crate) fn finish_fetch(
        &self,
        key: &QueryKey,
        elapsed: Duration,
        outcome: Result<(), &QueryError>,
    ) {
        let tracked = outcome.err().map(|error| self.tracked(error.clone()));
        self.state.send_modify(|state| {
            state.loading_keys.remove(key);
            state.metrics.fetches += 1;
            state.metrics.total_fetch_time += elapsed;
            match tracked {
                Some(tracked) => {
                    state.metrics.failures += 1;
                    state.errors_by_key.insert(key.to_string(), tracked);
                }
                None => {
                    state.errors_by_key.remove(key.as_str());
                }
            }
        });
    }

    /// Drop a key from the loading set without counting a fetch.
    pub(crate) fn abandon_fetch(&self, key: &QueryKey) {
        self.state.send_if_modified(|state| state.loading_keys.remove(key));
    }

    /// Record an error that did not come from a fetch (e.g. a bad cursor).
    pub(crate) fn record_error(&self, key: &str, error: QueryError) {
        let tracked = self.tracked(error);
        self.state.send_modify(|state| {
            state.errors_by_key.insert(key.to_string(), tracked);
        });
    }

    pub fn clear_error(&self, key: &str) {
        self.state
            .send_if_modified(|state| state.errors_by_key.remove(key).is_some());
    }

    pub(crate) fn record_hit(&self) {
        self.state.send_modify(|state| state.metrics.hits += 1);
    }

    pub(crate) fn record_miss(&self) {
        self.state.send_modify(|state| state.metrics.misses += 1);
    }

    pub(crate) fn begin_mutation(&self) {
        self.state.send_modify(|state| state.pending_mutations += 1);
    }

    pub(crate) fn finish_mutation(&self, name: &str, outcome: Result<(), &QueryError>) {
        let tracked = outcome.err().map(|error| self.tracked(error.clone()));
        let key = mutation_error_key(name);
        self.state.send_modify(|state| {
            state.pending_mutations = state.pending_mutations.saturating_sub(1);
            match tracked {
                Some(tracked) => {
                    state.errors_by_key.insert(key, tracked);
                }
                None => {
                    state.errors_by_key.remove(&key);
                }
            }
        });
    }

    /// Forget everything, keeping subscribers attached.
    pub fn reset(&self) {
        self.state.send_replace(GlobalQueryState::default());
    }

    fn tracked(&self, error: QueryError) -> TrackedError {
        TrackedError {
            error,
            recorded_at: OffsetDateTime::now_utc(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
        }
    }
}

impl Default for GlobalStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Key under which mutation errors are recorded in `errors_by_key`.
pub fn mutation_error_key(name: &str) -> String {
    format!("mutation:{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> QueryKey {
        QueryKey::new(raw).unwrap()
    }

    #[test]
    fn is_fetching_tracks_loading_keys() {
        let tracker = GlobalStateTracker::new();
        assert!(!tracker.is_fetching());

        tracker.begin_fetch(&key("a"));
        tracker.begin_fetch(&key("b"));
        assert!(tracker.is_fetching());

        tracker.finish_fetch(&key("a"), Duration::from_millis(10), Ok(()));
        assert!(tracker.is_fetching());

        tracker.finish_fetch(&key("b"), Duration::from_millis(30), Ok(()));
        assert!(!tracker.is_fetching());

        let metrics = tracker.snapshot().metrics;
        assert_eq!(metrics.fetches, 2);
        assert_eq!(metrics.average_fetch_time(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn global_error_is_most_recent_remaining() {
        let tracker = GlobalStateTracker::new();
        let first = QueryError::fetch("first");
        let second = QueryError::fetch("second");

        tracker.finish_fetch(&key("a"), Duration::ZERO, Err(&first));
        tracker.finish_fetch(&key("b"), Duration::ZERO, Err(&second));
        assert_eq!(tracker.global_error(), Some(("b".to_string(), second)));

        // A successful refetch of `b` clears its error.
        tracker.finish_fetch(&key("b"), Duration::ZERO, Ok(()));
        assert_eq!(tracker.global_error(), Some(("a".to_string(), first)));

        tracker.clear_error("a");
        assert!(tracker.global_error().is_none());
    }

    #[test]
    fn mutations_are_counted_and_errors_keyed_by_name() {
        let tracker = GlobalStateTracker::new();
        tracker.begin_mutation();
        assert!(tracker.is_mutating());

        let error = QueryError::fetch("rejected");
        tracker.finish_mutation("like_post", Err(&error));
        assert!(!tracker.is_mutating());
        assert_eq!(tracker.error_for("mutation:like_post"), Some(error));
    }

    #[tokio::test]
    async fn subscribers_see_updates() {
        let tracker = GlobalStateTracker::new();
        let mut rx = tracker.subscribe();

        tracker.begin_fetch(&key("a"));
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_fetching());
    }

    #[test]
    fn hit_rate_from_counters() {
        let tracker = GlobalStateTracker::new();
        tracker.record_hit();
        tracker.record_hit();
        tracker.record_hit();
        tracker.record_miss();
        assert!((tracker.snapshot().metrics.hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
