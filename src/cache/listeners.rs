//! Bidirectional listener registry.
//!
//! Tracks which `on_change` callbacks are interested in which keys. Exact
//! subscriptions are indexed by key; wildcard subscriptions are scanned.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::error;

use super::events::ChangeEvent;
use super::key::KeyPattern;
use super::lock::{read_lock, write_lock};

const SOURCE: &str = "cache::listeners";

/// Callback invoked for every matching change event.
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Handle returned by `on_change`; pass it to `remove_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

struct Listener {
    pattern: KeyPattern,
    callback: ChangeCallback,
}

#[derive(Default)]
struct Index {
    listeners: HashMap<ListenerId, Listener>,
    /// Exact key → listeners subscribed to exactly that key
    by_key: HashMap<String, HashSet<ListenerId>>,
    /// Listeners whose pattern has wildcards or is a regex
    wildcard: HashSet<ListenerId>,
}

/// Tracks listener → pattern and key → listeners mappings.
pub struct ListenerRegistry {
    next_id: AtomicU64,
    index: RwLock<Index>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            index: RwLock::new(Index::default()),
        }
    }

    /// Register a callback for every key matching `pattern`.
    pub fn register(&self, pattern: KeyPattern, callback: ChangeCallback) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut index = write_lock(&self.index, SOURCE, "register");

        if pattern.is_exact() {
            index
                .by_key
                .entry(pattern.as_str().to_string())
                .or_default()
                .insert(id);
        } else {
            index.wildcard.insert(id);
        }
        index.listeners.insert(id, Listener { pattern, callback });
        id
    }

    /// Remove a listener and clean up its key mapping.
    ///
    /// Returns false if the listener was already gone.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut index = write_lock(&self.index, SOURCE, "unregister");
        let Some(listener) = index.listeners.remove(&id) else {
            return false;
        };

        if listener.pattern.is_exact() {
            let key = listener.pattern.as_str();
            if let Some(ids) = index.by_key.get_mut(key) {
                ids.remove(&id);
                if ids.is_empty() {
                    index.by_key.remove(key);
                }
            }
        } else {
            index.wildcard.remove(&id);
        }
        true
    }

    /// Get every callback interested in `key`, in registration order.
    pub fn callbacks_for(&self, key: &str) -> Vec<ChangeCallback> {
        let index = read_lock(&self.index, SOURCE, "callbacks_for");

        let mut ids: Vec<ListenerId> = index
            .by_key
            .get(key)
            .into_iter()
            .flatten()
            .copied()
            .chain(
                index
                    .wildcard
                    .iter()
                    .filter(|id| {
                        index
                            .listeners
                            .get(id)
                            .is_some_and(|listener| listener.pattern.matches(key))
                    })
                    .copied(),
            )
            .collect();
        ids.sort_unstable();

        ids.iter()
            .filter_map(|id| index.listeners.get(id))
            .map(|listener| Arc::clone(&listener.callback))
            .collect()
    }

    /// Deliver events to matching listeners.
    ///
    /// Must be called without holding any store lock. A panicking listener is
    /// logged and does not prevent delivery to the others.
    pub fn dispatch(&self, events: &[ChangeEvent]) {
        for event in events {
            for callback in self.callbacks_for(event.key.as_str()) {
                let outcome = catch_unwind(AssertUnwindSafe(|| callback(event)));
                if outcome.is_err() {
                    error!(
                        key = %event.key,
                        kind = ?event.kind,
                        epoch = event.epoch,
                        "Cache listener panicked"
                    );
                }
            }
        }
    }

    /// Clear all listeners.
    pub fn clear(&self) {
        let mut index = write_lock(&self.index, SOURCE, "clear");
        index.listeners.clear();
        index.by_key.clear();
        index.wildcard.clear();
    }

    /// Get the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        read_lock(&self.index, SOURCE, "listener_count")
            .listeners
            .len()
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::cache::events::{ChangeKind, EpochCounter};
    use crate::cache::key::QueryKey;

    fn recorder() -> (ChangeCallback, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ChangeCallback = Arc::new(move |event: &ChangeEvent| {
            sink.lock().unwrap().push(event.key.to_string());
        });
        (callback, seen)
    }

    #[test]
    fn exact_and_wildcard_lookup() {
        let registry = ListenerRegistry::new();
        let (exact, _) = recorder();
        let (wildcard, _) = recorder();

        registry.register(KeyPattern::parse("chat:1:messages").unwrap(), exact);
        registry.register(KeyPattern::parse("chat:1:*").unwrap(), wildcard);

        assert_eq!(registry.callbacks_for("chat:1:messages").len(), 2);
        assert_eq!(registry.callbacks_for("chat:1:members").len(), 1);
        assert!(registry.callbacks_for("chat:2:messages").is_empty());
    }

    #[test]
    fn unregister_cleans_up_mappings() {
        let registry = ListenerRegistry::new();
        let (callback, _) = recorder();

        let id = registry.register(KeyPattern::parse("user:1").unwrap(), callback);
        assert_eq!(registry.listener_count(), 1);

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert_eq!(registry.listener_count(), 0);
        assert!(registry.callbacks_for("user:1").is_empty());
    }

    #[test]
    fn dispatch_survives_panicking_listener() {
        let registry = ListenerRegistry::new();
        let counter = EpochCounter::new();
        let (callback, seen) = recorder();

        registry.register(
            KeyPattern::any(),
            Arc::new(|_: &ChangeEvent| panic!("listener bug")),
        );
        registry.register(KeyPattern::any(), callback);

        let event = counter.event(QueryKey::new("user:1").unwrap(), ChangeKind::Set);
        registry.dispatch(&[event]);

        assert_eq!(*seen.lock().unwrap(), vec!["user:1".to_string()]);
    }

    #[test]
    fn clear_removes_all_listeners() {
        let registry = ListenerRegistry::new();
        let (callback, _) = recorder();
        registry.register(KeyPattern::any(), callback);

        registry.clear();
        assert_eq!(registry.listener_count(), 0);
    }
}
