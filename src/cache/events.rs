//! Cache change events.
//!
//! Every write to the store produces a `ChangeEvent` that is delivered to the
//! listeners whose pattern matches the key.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;

use super::key::QueryKey;

/// Monotonic epoch for ordering events.
///
/// Each event gets a unique, monotonically increasing epoch number so
/// listeners can tell which of two notifications for a key is newer.
pub type Epoch = u64;

/// What happened to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// The entry was inserted or overwritten.
    Set,
    /// The entry was removed with `delete`.
    Deleted,
    /// The entry was removed by `invalidate_pattern`.
    Invalidated,
    /// The entry was removed to make room (LRU).
    Evicted,
    /// The entry outlived its cache time.
    Expired,
    /// The entry is still servable but must be refreshed.
    MarkedStale,
}

impl ChangeKind {
    /// Whether the entry is gone after this event.
    pub fn is_removal(self) -> bool {
        matches!(
            self,
            ChangeKind::Deleted | ChangeKind::Invalidated | ChangeKind::Evicted | ChangeKind::Expired
        )
    }

    /// Whether an active observer should refetch in response.
    pub fn requests_refresh(self) -> bool {
        matches!(
            self,
            ChangeKind::Deleted | ChangeKind::Invalidated | ChangeKind::MarkedStale
        )
    }
}

/// Notification delivered to `on_change` listeners.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub epoch: Epoch,
    pub key: QueryKey,
    pub kind: ChangeKind,
    pub at: Instant,
}

/// Hands out epochs for change events.
#[derive(Debug, Default)]
pub struct EpochCounter {
    next: AtomicU64,
}

impl EpochCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_epoch(&self) -> Epoch {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    pub fn event(&self, key: QueryKey, kind: ChangeKind) -> ChangeEvent {
        ChangeEvent {
            epoch: self.next_epoch(),
            key,
            kind,
            at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_monotonicity() {
        let counter = EpochCounter::new();

        let e1 = counter.next_epoch();
        let e2 = counter.next_epoch();
        let e3 = counter.next_epoch();

        assert!(e1 < e2);
        assert!(e2 < e3);
    }

    #[test]
    fn events_carry_increasing_epochs() {
        let counter = EpochCounter::new();
        let key = QueryKey::new("user:1").unwrap();

        let first = counter.event(key.clone(), ChangeKind::Set);
        let second = counter.event(key, ChangeKind::Deleted);

        assert!(first.epoch < second.epoch);
        assert_eq!(second.kind, ChangeKind::Deleted);
    }

    #[test]
    fn removal_and_refresh_classification() {
        assert!(ChangeKind::Evicted.is_removal());
        assert!(!ChangeKind::MarkedStale.is_removal());
        assert!(ChangeKind::MarkedStale.requests_refresh());
        assert!(ChangeKind::Invalidated.requests_refresh());
        assert!(!ChangeKind::Evicted.requests_refresh());
        assert!(!ChangeKind::Set.requests_refresh());
    }
}
