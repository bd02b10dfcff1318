//! Query coordinator.
//!
//! Executes and de-duplicates fetches, keeps reference-counted observers per
//! key and reacts to cache changes (invalidation triggers a refetch while
//! anyone is subscribed).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::histogram;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::fetcher::Fetcher;
use super::options::QueryOptions;
use super::retry::run_with_retry;
use super::state::QueryState;
use crate::cache::{
    CacheEntry, CacheStore, ChangeEvent, ChangeKind, KeyPattern, ListenerId, QueryKey, mutex_lock,
};
use crate::error::{QueryError, QueryResult};
use crate::tracker::GlobalStateTracker;

const SOURCE: &str = "query::coordinator";

pub(crate) const METRIC_FETCH_MS: &str = "reactive_query_fetch_ms";

/// The single in-flight fetch for a key, shared by every waiter.
pub type SharedFetch = Shared<BoxFuture<'static, QueryResult<Arc<Value>>>>;

/// Key, fetcher and options of a query.
#[derive(Clone)]
pub struct QueryDescriptor {
    pub key: QueryKey,
    pub fetcher: Arc<dyn Fetcher>,
    pub options: QueryOptions,
}

impl QueryDescriptor {
    pub fn new<F>(key: QueryKey, fetcher: F) -> Self
    where
        F: Fetcher + 'static,
    {
        Self::from_shared(key, Arc::new(fetcher))
    }

    pub fn from_shared(key: QueryKey, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            key,
            fetcher,
            options: QueryOptions::default(),
        }
    }

    pub fn options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

impl fmt::Debug for QueryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDescriptor")
            .field("key", &self.key)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Fresh for the caller when neither the entry's own stale time nor the
/// query's `stale_time` has passed.
fn is_fresh(entry: &CacheEntry, options: &QueryOptions, now: Instant) -> bool {
    !entry.is_stale(now) && entry.age(now) < options.stale_time
}

struct InFlight {
    id: u64,
    shared: SharedFetch,
    abort: AbortHandle,
    /// Set when the key was invalidated mid-flight; triggers one more fetch.
    refresh_after: bool,
}

struct Observer {
    subscribers: usize,
    descriptor: QueryDescriptor,
    state: watch::Sender<QueryState>,
    listener: Option<ListenerId>,
    poller: Option<AbortHandle>,
}

#[derive(Default)]
struct Registry {
    in_flight: HashMap<QueryKey, InFlight>,
    observers: HashMap<QueryKey, Observer>,
}

struct Inner {
    cache: Arc<CacheStore>,
    tracker: Arc<GlobalStateTracker>,
    registry: Mutex<Registry>,
    next_fetch_id: AtomicU64,
}

/// Executes and de-duplicates single-value fetches.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct QueryCoordinator {
    inner: Arc<Inner>,
}

impl QueryCoordinator {
    pub fn new(cache: Arc<CacheStore>, tracker: Arc<GlobalStateTracker>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                tracker,
                registry: Mutex::new(Registry::default()),
                next_fetch_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.inner.cache
    }

    pub fn tracker(&self) -> &Arc<GlobalStateTracker> {
        &self.inner.tracker
    }

    /// Attach a consumer to `descriptor.key`.
    ///
    /// The first subscriber serves cached data when present and fetches when
    /// the key is absent or stale. Later subscribers share the same observer.
    /// Dropping the handle unsubscribes.
    #[instrument(skip_all, fields(key = %descriptor.key))]
    pub fn subscribe(&self, descriptor: QueryDescriptor) -> QueryResult<QueryHandle> {
        descriptor.options.ttl()?;
        let inner = &self.inner;
        let key = descriptor.key.clone();

        if let Some(receiver) = inner.attach_existing(&key) {
            return Ok(QueryHandle::new(key, Arc::clone(inner), receiver));
        }

        let cached = inner.cache.get(&key);
        let entry = inner.cache.entry(&key);
        let stale = entry
            .as_ref()
            .is_none_or(|entry| !is_fresh(entry, &descriptor.options, Instant::now()));
        match cached {
            Some(_) => inner.tracker.record_hit(),
            None => inner.tracker.record_miss(),
        }
        let needs_fetch = descriptor.options.enabled && (cached.is_none() || stale);

        let (state, receiver) = watch::channel(QueryState {
            data: cached,
            is_stale: stale,
            updated_at: entry.map(|entry| entry.inserted_at),
            ..QueryState::default()
        });

        {
            let mut registry = mutex_lock(&inner.registry, SOURCE, "subscribe");
            if let Some(observer) = registry.observers.get_mut(&key) {
                observer.subscribers += 1;
                let receiver = observer.state.subscribe();
                return Ok(QueryHandle::new(key, Arc::clone(inner), receiver));
            }
            if registry.in_flight.contains_key(&key) {
                state.send_modify(QueryState::start_fetching);
            }
            registry.observers.insert(
                key.clone(),
                Observer {
                    subscribers: 1,
                    descriptor: descriptor.clone(),
                    state,
                    listener: None,
                    poller: None,
                },
            );
        }

        let listener = inner.watch_key(&key);
        let poller = descriptor
            .options
            .refetch_interval
            .and_then(|period| inner.spawn_poller(&key, period));
        {
            let mut registry = mutex_lock(&inner.registry, SOURCE, "subscribe.attach");
            if let Some(observer) = registry.observers.get_mut(&key) {
                observer.listener = Some(listener);
                observer.poller = poller;
            }
        }

        debug!(needs_fetch, stale, "Observer created");
        if needs_fetch {
            drop(inner.start_fetch(&key, descriptor.fetcher, &descriptor.options));
        }
        Ok(QueryHandle::new(key, Arc::clone(inner), receiver))
    }

    /// Return fresh cached data or fetch it, joining any in-flight fetch.
    #[instrument(skip(self, fetcher, options), fields(key = %key))]
    pub async fn fetch(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn Fetcher>,
        options: &QueryOptions,
    ) -> QueryResult<Arc<Value>> {
        options.ttl()?;
        let fresh = self
            .inner
            .cache
            .entry(key)
            .is_some_and(|entry| is_fresh(&entry, options, Instant::now()));
        if fresh {
            if let Some(value) = self.inner.cache.get(key) {
                self.inner.tracker.record_hit();
                return Ok(value);
            }
        }
        self.inner.tracker.record_miss();
        self.inner.start_fetch(key, fetcher, options).await
    }

    /// Fetch regardless of freshness (still joins an in-flight fetch).
    #[instrument(skip(self, fetcher, options), fields(key = %key))]
    pub async fn fetch_fresh(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn Fetcher>,
        options: &QueryOptions,
    ) -> QueryResult<Arc<Value>> {
        options.ttl()?;
        self.inner.start_fetch(key, fetcher, options).await
    }

    /// Warm the cache without subscribing.
    pub async fn prefetch(&self, descriptor: &QueryDescriptor) -> QueryResult<()> {
        self.fetch(
            &descriptor.key,
            Arc::clone(&descriptor.fetcher),
            &descriptor.options,
        )
        .await
        .map(|_| ())
    }

    /// Non-reactive read; logs a stale-data warning past `cache_time`.
    pub fn get_query_data(&self, key: &QueryKey, cache_time: Duration) -> Option<Arc<Value>> {
        self.inner.cache.read_untracked(key, cache_time)
    }

    /// Write authoritative data for `key`; observers see it immediately.
    pub fn set_query_data(
        &self,
        key: QueryKey,
        value: Value,
        options: &QueryOptions,
    ) -> QueryResult<u64> {
        let ttl = options.ttl()?;
        Ok(self.inner.cache.set_with(key, Arc::new(value), ttl))
    }

    /// Invalidate matching keys; subscribed keys refetch.
    pub fn invalidate(&self, pattern: &str) -> QueryResult<usize> {
        self.inner.cache.invalidate_pattern(pattern)
    }

    /// Abort the in-flight fetch for `key` and discard its result.
    pub fn cancel(&self, key: &QueryKey) -> bool {
        self.inner.cancel(key)
    }

    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        mutex_lock(&self.inner.registry, SOURCE, "is_fetching")
            .in_flight
            .contains_key(key)
    }

    /// Number of live handles for `key`.
    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        mutex_lock(&self.inner.registry, SOURCE, "subscriber_count")
            .observers
            .get(key)
            .map_or(0, |observer| observer.subscribers)
    }

    /// Abort every fetch and tear down every observer.
    pub fn dispose(&self) {
        let (in_flight, observers) = {
            let mut registry = mutex_lock(&self.inner.registry, SOURCE, "dispose");
            (
                std::mem::take(&mut registry.in_flight),
                std::mem::take(&mut registry.observers),
            )
        };

        for (key, fetch) in in_flight {
            fetch.abort.abort();
            self.inner.tracker.abandon_fetch(&key);
        }
        for observer in observers.into_values() {
            observer.teardown(&self.inner.cache);
        }
        info!("Query coordinator disposed");
    }
}

impl Observer {
    fn teardown(self, cache: &CacheStore) {
        if let Some(listener) = self.listener {
            cache.remove_listener(listener);
        }
        if let Some(poller) = self.poller {
            poller.abort();
        }
    }
}

impl Inner {
    fn attach_existing(&self, key: &QueryKey) -> Option<watch::Receiver<QueryState>> {
        let mut registry = mutex_lock(&self.registry, SOURCE, "attach_existing");
        let observer = registry.observers.get_mut(key)?;
        observer.subscribers += 1;
        debug!(key = %key, subscribers = observer.subscribers, "Attached to existing observer");
        Some(observer.state.subscribe())
    }

    /// Start a fetch for `key` or join the one already in flight.
    fn start_fetch(
        self: &Arc<Self>,
        key: &QueryKey,
        fetcher: Arc<dyn Fetcher>,
        options: &QueryOptions,
    ) -> SharedFetch {
        let mut guard = mutex_lock(&self.registry, SOURCE, "start_fetch");
        let registry = &mut *guard;
        if let Some(in_flight) = registry.in_flight.get(key) {
            debug!(key = %key, fetch_id = in_flight.id, "Joining in-flight fetch");
            return in_flight.shared.clone();
        }

        let Ok(runtime) = Handle::try_current() else {
            error!(key = %key, "No tokio runtime available; fetch not started");
            return futures::future::ready(Err(QueryError::fetch(
                "no async runtime available to run the fetch",
            )))
            .boxed()
            .shared();
        };

        let id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let task = runtime.spawn(Arc::clone(self).run_fetch(
            id,
            key.clone(),
            fetcher,
            options.clone(),
        ));
        let abort = task.abort_handle();
        let shared = async move {
            match task.await {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => Err(QueryError::Cancelled),
                Err(err) => Err(QueryError::fetch(format!("fetch task failed: {err}"))),
            }
        }
        .boxed()
        .shared();

        registry.in_flight.insert(
            key.clone(),
            InFlight {
                id,
                shared: shared.clone(),
                abort,
                refresh_after: false,
            },
        );
        if let Some(observer) = registry.observers.get(key) {
            observer.state.send_modify(QueryState::start_fetching);
        }
        self.tracker.begin_fetch(key);
        info!(key = %key, fetch_id = id, "Fetch started");
        shared
    }

    async fn run_fetch(
        self: Arc<Self>,
        id: u64,
        key: QueryKey,
        fetcher: Arc<dyn Fetcher>,
        options: QueryOptions,
    ) -> QueryResult<Arc<Value>> {
        let started = Instant::now();
        let result = run_with_retry(
            &options.retry,
            options.timeout,
            "query",
            key.as_str(),
            || {
                let fetcher = Arc::clone(&fetcher);
                async move { fetcher.fetch().await.map_err(QueryError::from) }
            },
        )
        .await
        .map(Arc::new);

        let elapsed = started.elapsed();
        histogram!(METRIC_FETCH_MS).record(elapsed.as_secs_f64() * 1000.0);
        self.complete_fetch(id, &key, &options, elapsed, result)
    }

    /// Apply a finished fetch: cache, tracker, then observers.
    fn complete_fetch(
        self: &Arc<Self>,
        id: u64,
        key: &QueryKey,
        options: &QueryOptions,
        elapsed: Duration,
        result: QueryResult<Arc<Value>>,
    ) -> QueryResult<Arc<Value>> {
        let current = mutex_lock(&self.registry, SOURCE, "complete_fetch.check")
            .in_flight
            .get(key)
            .is_some_and(|in_flight| in_flight.id == id);
        if !current {
            debug!(key = %key, fetch_id = id, "Discarding result of cancelled fetch");
            return result;
        }

        if let Ok(value) = &result {
            match options.ttl() {
                Ok(ttl) => {
                    self.cache.set_with(key.clone(), Arc::clone(value), ttl);
                }
                Err(err) => warn!(key = %key, error = %err, "Fetched value not cached"),
            }
        }
        self.tracker
            .finish_fetch(key, elapsed, result.as_ref().map(|_| ()));

        let refresh = {
            let mut guard = mutex_lock(&self.registry, SOURCE, "complete_fetch.apply");
            let registry = &mut *guard;
            let refresh_after = match registry.in_flight.get(key) {
                Some(in_flight) if in_flight.id == id => registry
                    .in_flight
                    .remove(key)
                    .is_some_and(|in_flight| in_flight.refresh_after),
                _ => false,
            };
            registry.observers.get(key).and_then(|observer| {
                match &result {
                    Ok(value) => observer
                        .state
                        .send_modify(|state| state.settle_ok(Arc::clone(value))),
                    Err(error) => observer
                        .state
                        .send_modify(|state| state.settle_err(error.clone())),
                }
                refresh_after.then(|| {
                    (
                        Arc::clone(&observer.descriptor.fetcher),
                        observer.descriptor.options.clone(),
                    )
                })
            })
        };

        match &result {
            Ok(_) => info!(
                key = %key,
                fetch_id = id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Fetch succeeded"
            ),
            Err(error) => warn!(
                key = %key,
                fetch_id = id,
                elapsed_ms = elapsed.as_millis() as u64,
                error = %error,
                "Fetch failed"
            ),
        }

        if let Some((fetcher, options)) = refresh {
            debug!(key = %key, "Refetching after mid-flight invalidation");
            drop(self.start_fetch(key, fetcher, &options));
        }
        result
    }

    fn cancel(&self, key: &QueryKey) -> bool {
        let fetch_id = {
            let mut guard = mutex_lock(&self.registry, SOURCE, "cancel");
            let registry = &mut *guard;
            let Some(in_flight) = registry.in_flight.remove(key) else {
                return false;
            };
            in_flight.abort.abort();
            if let Some(observer) = registry.observers.get(key) {
                observer.state.send_modify(QueryState::abandon);
            }
            in_flight.id
        };
        self.tracker.abandon_fetch(key);
        info!(key = %key, fetch_id, "Fetch cancelled");
        true
    }

    /// Fetcher and options of the observer for `key`, if anyone is subscribed.
    fn observed_target(&self, key: &QueryKey) -> Option<(Arc<dyn Fetcher>, QueryOptions)> {
        mutex_lock(&self.registry, SOURCE, "observed_target")
            .observers
            .get(key)
            .map(|observer| {
                (
                    Arc::clone(&observer.descriptor.fetcher),
                    observer.descriptor.options.clone(),
                )
            })
    }

    fn watch_key(self: &Arc<Self>, key: &QueryKey) -> ListenerId {
        let weak = Arc::downgrade(self);
        self.cache.on_change(KeyPattern::exact(key), move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_cache_change(event);
            }
        })
    }

    fn on_cache_change(self: &Arc<Self>, event: &ChangeEvent) {
        match event.kind {
            ChangeKind::Set => self.publish_cached(&event.key),
            kind if kind.requests_refresh() => self.refresh_observed(&event.key),
            _ => {}
        }
    }

    /// Push a value written directly to the cache (optimistic patch,
    /// rollback, `set_query_data`) to the key's observer.
    fn publish_cached(&self, key: &QueryKey) {
        let Some(entry) = self.cache.entry(key) else {
            return;
        };
        let stale = entry.is_stale(Instant::now());
        let registry = mutex_lock(&self.registry, SOURCE, "publish_cached");
        if let Some(observer) = registry.observers.get(key) {
            observer.state.send_if_modified(|state| {
                if state.data.as_ref() == Some(&entry.value) && state.is_stale == stale {
                    return false;
                }
                state.data = Some(Arc::clone(&entry.value));
                state.is_stale = stale;
                state.is_loading = false;
                true
            });
        }
    }

    fn refresh_observed(self: &Arc<Self>, key: &QueryKey) {
        let target = {
            let mut guard = mutex_lock(&self.registry, SOURCE, "refresh_observed");
            let registry = &mut *guard;
            let Some(observer) = registry.observers.get(key) else {
                return;
            };
            observer.state.send_modify(|state| state.is_stale = true);
            if !observer.descriptor.options.enabled {
                return;
            }
            if let Some(in_flight) = registry.in_flight.get_mut(key) {
                in_flight.refresh_after = true;
                return;
            }
            (
                Arc::clone(&observer.descriptor.fetcher),
                observer.descriptor.options.clone(),
            )
        };
        debug!(key = %key, "Observed key invalidated; refetching");
        drop(self.start_fetch(key, target.0, &target.1));
    }

    fn spawn_poller(self: &Arc<Self>, key: &QueryKey, period: Duration) -> Option<AbortHandle> {
        let runtime = Handle::try_current().ok()?;
        let weak = Arc::downgrade(self);
        let key = key.clone();
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Some((fetcher, options)) = inner.observed_target(&key) {
                    drop(inner.start_fetch(&key, fetcher, &options));
                }
            }
        });
        Some(task.abort_handle())
    }

    fn release(&self, key: &QueryKey) {
        let torn_down = {
            let mut registry = mutex_lock(&self.registry, SOURCE, "release");
            let Some(observer) = registry.observers.get_mut(key) else {
                return;
            };
            observer.subscribers = observer.subscribers.saturating_sub(1);
            if observer.subscribers > 0 {
                return;
            }
            registry.observers.remove(key)
        };

        if let Some(observer) = torn_down {
            observer.teardown(&self.cache);
            debug!(key = %key, "Last subscriber left; observer torn down");
        }
    }
}

/// A consumer's subscription to one key. Dropping it unsubscribes.
pub struct QueryHandle {
    key: QueryKey,
    inner: Arc<Inner>,
    state: watch::Receiver<QueryState>,
}

impl QueryHandle {
    fn new(key: QueryKey, inner: Arc<Inner>, state: watch::Receiver<QueryState>) -> Self {
        Self { key, inner, state }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Current snapshot.
    pub fn state(&self) -> QueryState {
        self.state.borrow().clone()
    }

    /// Wait for the next notification. `None` once the observer is gone.
    pub async fn changed(&mut self) -> Option<QueryState> {
        self.state.changed().await.ok()?;
        Some(self.state.borrow_and_update().clone())
    }

    /// Wait until no fetch is in flight for the key.
    pub async fn settled(&mut self) -> QueryState {
        if let Ok(state) = self.state.wait_for(|state| !state.is_fetching).await {
            return state.clone();
        }
        self.state.borrow().clone()
    }

    /// Fetch regardless of staleness; the old value stays visible meanwhile.
    pub async fn refetch(&self) -> QueryResult<Arc<Value>> {
        let (fetcher, options) = self
            .inner
            .observed_target(&self.key)
            .ok_or(QueryError::Cancelled)?;
        self.inner.start_fetch(&self.key, fetcher, &options).await
    }

    /// Abort the in-flight fetch and discard its result.
    pub fn cancel(&self) -> bool {
        self.inner.cancel(&self.key)
    }
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        self.inner.release(&self.key);
    }
}

impl fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("key", &self.key)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;
    use crate::cache::CacheConfig;
    use crate::error::FetchError;
    use crate::query::options::RetryPolicy;

    fn key(raw: &str) -> QueryKey {
        QueryKey::new(raw).unwrap()
    }

    fn coordinator() -> QueryCoordinator {
        QueryCoordinator::new(
            Arc::new(CacheStore::new(CacheConfig::default())),
            Arc::new(GlobalStateTracker::new()),
        )
    }

    /// Fetcher that sleeps then returns the number of calls so far.
    fn slow_counter(calls: &Arc<AtomicUsize>, delay: Duration) -> Arc<dyn Fetcher> {
        let calls = Arc::clone(calls);
        Arc::new(move || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                tokio::time::sleep(delay).await;
                Ok(json!(n))
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_fetches_are_deduplicated() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = slow_counter(&calls, Duration::from_millis(100));
        let options = QueryOptions::default();

        let feed = key("feed");
        let (a, b) = tokio::join!(
            coordinator.fetch(&feed, Arc::clone(&fetcher), &options),
            coordinator.fetch(&feed, Arc::clone(&fetcher), &options),
        );

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_cache_skips_fetch() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = slow_counter(&calls, Duration::from_millis(1));
        let options = QueryOptions::default().stale_time(Duration::from_secs(60));

        coordinator
            .fetch(&key("a"), Arc::clone(&fetcher), &options)
            .await
            .unwrap();
        coordinator
            .fetch(&key("a"), Arc::clone(&fetcher), &options)
            .await
            .unwrap();

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_serves_fresh_cache_without_loading() {
        let coordinator = coordinator();
        coordinator
            .cache()
            .set(key("user:1"), json!({"name": "A"}), Duration::from_secs(60))
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let handle = coordinator
            .subscribe(
                QueryDescriptor::from_shared(key("user:1"), slow_counter(&calls, Duration::ZERO))
                    .options(QueryOptions::default().stale_time(Duration::from_secs(30))),
            )
            .unwrap();

        let state = handle.state();
        assert_eq!(state.data, Some(Arc::new(json!({"name": "A"}))));
        assert!(!state.is_loading);
        assert!(!state.is_fetching);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_cache_is_served_while_revalidating() {
        let coordinator = coordinator();
        coordinator
            .cache()
            .set(key("feed"), json!("old"), Duration::from_secs(60))
            .unwrap();
        let fetcher: Arc<dyn Fetcher> = Arc::new(|| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(json!("new"))
        });

        // stale_time 0: the cached entry is immediately stale.
        let mut handle = coordinator
            .subscribe(QueryDescriptor::from_shared(key("feed"), fetcher))
            .unwrap();

        let state = handle.state();
        assert_eq!(state.data, Some(Arc::new(json!("old"))));
        assert!(state.is_fetching);
        assert!(!state.is_loading);

        let settled = handle.settled().await;
        assert_eq!(settled.data, Some(Arc::new(json!("new"))));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_key_marks_global_loading() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handle = coordinator
            .subscribe(QueryDescriptor::from_shared(
                key("profile"),
                slow_counter(&calls, Duration::from_millis(10)),
            ))
            .unwrap();

        assert!(handle.state().is_loading);
        assert!(coordinator.tracker().is_fetching());

        let state = handle.settled().await;
        assert_eq!(state.data, Some(Arc::new(json!(1))));
        assert!(!coordinator.tracker().is_fetching());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refetch_keeps_cached_value() {
        let coordinator = coordinator();
        coordinator
            .cache()
            .set(key("feed"), json!([1]), Duration::from_secs(60))
            .unwrap();
        let fetcher: Arc<dyn Fetcher> = Arc::new(|| async { Err(FetchError::new("offline")) });
        let options = QueryOptions::default().retry(RetryPolicy::new(2, Duration::from_millis(10)));

        let mut handle = coordinator
            .subscribe(QueryDescriptor::from_shared(key("feed"), fetcher).options(options))
            .unwrap();
        let state = handle.settled().await;

        assert_eq!(state.data, Some(Arc::new(json!([1]))));
        assert!(matches!(state.error, Some(QueryError::Fetch(_))));
        assert_eq!(coordinator.cache().peek(&key("feed")), Some(Arc::new(json!([1]))));
        assert!(coordinator.tracker().error_for("feed").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_share_one_observer() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = slow_counter(&calls, Duration::from_millis(10));

        let first = coordinator
            .subscribe(QueryDescriptor::from_shared(key("k"), Arc::clone(&fetcher)))
            .unwrap();
        let mut second = coordinator
            .subscribe(QueryDescriptor::from_shared(key("k"), fetcher))
            .unwrap();
        assert_eq!(coordinator.subscriber_count(&key("k")), 2);

        second.settled().await;
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(first.state().data, Some(Arc::new(json!(1))));

        drop(first);
        assert_eq!(coordinator.subscriber_count(&key("k")), 1);
        drop(second);
        assert_eq!(coordinator.subscriber_count(&key("k")), 0);
        assert_eq!(coordinator.cache().listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribing_lets_fetch_warm_the_cache() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = coordinator
            .subscribe(QueryDescriptor::from_shared(
                key("k"),
                slow_counter(&calls, Duration::from_millis(50)),
            ))
            .unwrap();
        drop(handle);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(coordinator.cache().peek(&key("k")), Some(Arc::new(json!(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_discards_the_result() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = coordinator
            .subscribe(QueryDescriptor::from_shared(
                key("k"),
                slow_counter(&calls, Duration::from_millis(50)),
            ))
            .unwrap();
        tokio::task::yield_now().await;

        assert!(handle.cancel());
        assert!(!coordinator.tracker().is_fetching());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(coordinator.cache().peek(&key("k")).is_none());
        assert!(!handle.state().is_fetching);
        assert!(!handle.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_refetches_for_every_subscriber() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = slow_counter(&calls, Duration::from_millis(10));

        let mut first = coordinator
            .subscribe(QueryDescriptor::from_shared(key("list"), Arc::clone(&fetcher)))
            .unwrap();
        first.settled().await;
        let mut second = coordinator
            .subscribe(QueryDescriptor::from_shared(key("list"), fetcher))
            .unwrap();

        coordinator.invalidate("list*").unwrap();
        assert!(first.state().is_fetching);

        let a = first.settled().await;
        let b = second.settled().await;
        assert_eq!(a.data, Some(Arc::new(json!(2))));
        assert_eq!(b.data, Some(Arc::new(json!(2))));
    }

    #[tokio::test(start_paused = true)]
    async fn refetch_keeps_old_value_visible() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handle = coordinator
            .subscribe(QueryDescriptor::from_shared(
                key("k"),
                slow_counter(&calls, Duration::from_millis(10)),
            ))
            .unwrap();
        handle.settled().await;

        let refetch = handle.refetch();
        tokio::pin!(refetch);
        assert!(futures::poll!(refetch.as_mut()).is_pending());
        assert_eq!(handle.state().data, Some(Arc::new(json!(1))));
        assert!(handle.state().is_fetching);

        assert_eq!(refetch.await.unwrap(), Arc::new(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_queries_do_not_fetch() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = coordinator
            .subscribe(
                QueryDescriptor::from_shared(key("k"), slow_counter(&calls, Duration::ZERO))
                    .options(QueryOptions::default().enabled(false)),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(handle.state().data.is_none());

        handle.refetch().await.unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refetch_interval_polls_while_subscribed() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = coordinator
            .subscribe(
                QueryDescriptor::from_shared(key("k"), slow_counter(&calls, Duration::ZERO))
                    .options(QueryOptions::default().refetch_interval(Duration::from_millis(100))),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 4);

        drop(handle);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn invalid_options_fail_synchronously() {
        let coordinator = coordinator();
        let fetcher: Arc<dyn Fetcher> = Arc::new(|| async { Ok(json!(null)) });
        let error = coordinator
            .subscribe(
                QueryDescriptor::from_shared(key("k"), fetcher)
                    .options(QueryOptions::default().cache_time(Duration::ZERO)),
            )
            .unwrap_err();
        assert!(error.is_configuration());
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_surface_after_retries() {
        let coordinator = coordinator();
        let fetcher: Arc<dyn Fetcher> = Arc::new(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!(1))
        });
        let options = QueryOptions::default()
            .retry(RetryPolicy::none())
            .timeout(Duration::from_millis(100));

        let error = coordinator
            .fetch(&key("slow"), fetcher, &options)
            .await
            .unwrap_err();
        assert!(matches!(error, QueryError::Timeout { .. }));
    }
}
