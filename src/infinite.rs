//! Paginated ("infinite") queries.
//!
//! Every page is an ordinary cache entry keyed `<base>:<param>` and fetched
//! through the query coordinator, so page fetches are de-duplicated and
//! tracked like any other key. The ordered page list lives here; a page's
//! param is derived from the page before it, so pages can only be appended
//! in fetch order.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::cache::{ChangeEvent, KeyPattern, ListenerId, QueryKey, mutex_lock};
use crate::error::{ConfigurationError, FetchError, QueryError, QueryResult};
use crate::query::{Fetcher, QueryCoordinator, QueryOptions};

const SOURCE: &str = "infinite";

/// Async producer of one page for a page param.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, param: Value) -> Result<Value, FetchError>;
}

#[async_trait]
impl<F, Fut> PageFetcher for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
{
    async fn fetch_page(&self, param: Value) -> Result<Value, FetchError> {
        (self)(param).await
    }
}

/// `(last_page, all_pages) -> next param`; `None` ends pagination.
pub type NextPageParam = Arc<dyn Fn(&Value, &[Arc<Value>]) -> Option<Value> + Send + Sync>;

#[derive(Clone)]
pub struct InfiniteQueryOptions {
    pub initial_page_param: Value,
    pub get_next_page_param: NextPageParam,
    /// Options applied to every page fetch.
    pub query: QueryOptions,
}

impl InfiniteQueryOptions {
    pub fn new<F>(initial_page_param: Value, get_next_page_param: F) -> Self
    where
        F: Fn(&Value, &[Arc<Value>]) -> Option<Value> + Send + Sync + 'static,
    {
        Self {
            initial_page_param,
            get_next_page_param: Arc::new(get_next_page_param),
            query: QueryOptions::default(),
        }
    }

    pub fn query(mut self, query: QueryOptions) -> Self {
        self.query = query;
        self
    }
}

impl fmt::Debug for InfiniteQueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfiniteQueryOptions")
            .field("initial_page_param", &self.initial_page_param)
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

/// What a consumer of a paginated query sees.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InfiniteState {
    /// Resolved pages in fetch order.
    pub pages: Vec<Arc<Value>>,
    pub page_params: Vec<Value>,
    pub has_next_page: bool,
    /// First page in flight.
    pub is_loading: bool,
    pub is_fetching_next_page: bool,
    pub is_refetching: bool,
    pub error: Option<QueryError>,
}

impl InfiniteState {
    /// Array pages are concatenated; any other page is appended whole.
    pub fn flattened(&self) -> Vec<Value> {
        flatten(&self.pages)
    }
}

fn flatten(pages: &[Arc<Value>]) -> Vec<Value> {
    let mut items = Vec::new();
    for page in pages {
        match page.as_ref() {
            Value::Array(values) => items.extend(values.iter().cloned()),
            other => items.push(other.clone()),
        }
    }
    items
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchNextOutcome {
    Fetched,
    /// Another page fetch or refetch owns the list right now.
    AlreadyFetching,
    NoMorePages,
    /// A refetch started while this page was in flight; the page was dropped.
    Superseded,
}

/// Creates paginated queries on top of a [`QueryCoordinator`].
#[derive(Clone)]
pub struct InfiniteQueryCoordinator {
    queries: QueryCoordinator,
}

impl InfiniteQueryCoordinator {
    pub fn new(queries: QueryCoordinator) -> Self {
        Self { queries }
    }

    /// Create a paginated query rooted at `base_key`. Nothing is fetched
    /// until the first `fetch_next_page`.
    pub fn create<P>(
        &self,
        base_key: QueryKey,
        fetcher: P,
        options: InfiniteQueryOptions,
    ) -> QueryResult<InfiniteQuery>
    where
        P: PageFetcher + 'static,
    {
        options.query.ttl()?;
        let pattern = KeyPattern::parse(&format!("{base_key}:*"))?;

        let inner = Arc::new(InfiniteInner {
            state: watch::Sender::new(InfiniteState {
                has_next_page: true,
                ..InfiniteState::default()
            }),
            progress: Mutex::new(Progress {
                next_param: Some(options.initial_page_param.clone()),
                ..Progress::default()
            }),
            refresh_scheduled: AtomicBool::new(false),
            base_key,
            fetcher: Arc::new(fetcher),
            options,
            queries: self.queries.clone(),
        });

        let weak = Arc::downgrade(&inner);
        let listener = self
            .queries
            .cache()
            .on_change(pattern, move |event| on_page_change(&weak, event));
        debug!(key = %inner.base_key, "Infinite query created");

        Ok(InfiniteQuery { inner, listener })
    }
}

#[derive(Default)]
struct Progress {
    pages: Vec<Arc<Value>>,
    params: Vec<Value>,
    next_param: Option<Value>,
    /// Bumped by every refetch; page results from an older walk are dropped.
    walk: u64,
    active: Option<u64>,
    next_op: u64,
}

struct InfiniteInner {
    base_key: QueryKey,
    fetcher: Arc<dyn PageFetcher>,
    options: InfiniteQueryOptions,
    queries: QueryCoordinator,
    state: watch::Sender<InfiniteState>,
    progress: Mutex<Progress>,
    refresh_scheduled: AtomicBool,
}

/// Releases the list's single operation slot, including on cancellation.
struct ActiveOp<'a> {
    inner: &'a InfiniteInner,
    op: u64,
}

impl Drop for ActiveOp<'_> {
    fn drop(&mut self) {
        let mut progress = mutex_lock(&self.inner.progress, SOURCE, "active_op.release");
        if progress.active == Some(self.op) {
            progress.active = None;
            self.inner.state.send_modify(|state| {
                state.is_loading = false;
                state.is_fetching_next_page = false;
                state.is_refetching = false;
            });
        }
    }
}

enum NextParam {
    Continue(Value),
    Done,
    Repeated(ConfigurationError),
}

impl InfiniteInner {
    fn page_key(&self, param: &Value) -> QueryResult<QueryKey> {
        self.base_key.page(param)
    }

    fn page_fetcher(&self, param: &Value) -> Arc<dyn Fetcher> {
        let fetcher = Arc::clone(&self.fetcher);
        let param = param.clone();
        Arc::new(move || {
            let fetcher = Arc::clone(&fetcher);
            let param = param.clone();
            async move { fetcher.fetch_page(param).await }
        })
    }

    async fn fetch_page(&self, param: &Value, fresh: bool) -> QueryResult<Arc<Value>> {
        let key = self.page_key(param)?;
        let fetcher = self.page_fetcher(param);
        if fresh {
            self.queries
                .fetch_fresh(&key, fetcher, &self.options.query)
                .await
        } else {
            self.queries.fetch(&key, fetcher, &self.options.query).await
        }
    }

    fn next_param(&self, param: &Value, pages: &[Arc<Value>]) -> NextParam {
        let Some(last) = pages.last() else {
            return NextParam::Done;
        };
        match (self.options.get_next_page_param)(last, pages) {
            None => NextParam::Done,
            Some(next) if next == *param => NextParam::Repeated(ConfigurationError::RepeatedCursor {
                key: self.base_key.to_string(),
                param: param.to_string(),
            }),
            Some(next) => NextParam::Continue(next),
        }
    }

    /// Claim the operation slot; `None` when it is taken.
    fn claim(&self, supersede: bool) -> Option<(ActiveOp<'_>, u64)> {
        let mut progress = mutex_lock(&self.progress, SOURCE, "claim");
        if progress.active.is_some() && !supersede {
            return None;
        }
        progress.next_op += 1;
        let op = progress.next_op;
        progress.active = Some(op);
        if supersede {
            progress.walk += 1;
        }
        Some((ActiveOp { inner: self, op }, progress.walk))
    }

    fn publish(&self, progress: &Progress, error: Option<QueryError>) {
        self.state.send_modify(|state| {
            state.pages = progress.pages.clone();
            state.page_params = progress.params.clone();
            state.has_next_page = progress.next_param.is_some();
            state.error = error;
        });
    }

    fn fail_pagination(&self, progress: &mut Progress, error: ConfigurationError) -> QueryError {
        let error = QueryError::from(error);
        progress.next_param = None;
        warn!(key = %self.base_key, error = %error, "Pagination terminated");
        self.queries
            .tracker()
            .record_error(self.base_key.as_str(), error.clone());
        self.publish(progress, Some(error.clone()));
        error
    }

    async fn fetch_next_page(&self) -> QueryResult<FetchNextOutcome> {
        let Some((_op, walk)) = self.claim(false) else {
            return Ok(FetchNextOutcome::AlreadyFetching);
        };
        let param = {
            let progress = mutex_lock(&self.progress, SOURCE, "fetch_next_page");
            match progress.next_param.clone() {
                Some(param) => param,
                None => return Ok(FetchNextOutcome::NoMorePages),
            }
        };
        self.state.send_modify(|state| {
            state.is_fetching_next_page = true;
            state.is_loading = state.pages.is_empty();
        });

        let result = self.fetch_page(&param, false).await;

        let mut progress = mutex_lock(&self.progress, SOURCE, "fetch_next_page.apply");
        if progress.walk != walk {
            debug!(key = %self.base_key, "Dropping page fetched before a refetch");
            return Ok(FetchNextOutcome::Superseded);
        }
        let page = match result {
            Ok(page) => page,
            Err(error) => {
                self.publish(&progress, Some(error.clone()));
                return Err(error);
            }
        };

        progress.pages.push(page);
        progress.params.push(param.clone());
        match self.next_param(&param, &progress.pages) {
            NextParam::Continue(next) => progress.next_param = Some(next),
            NextParam::Done => progress.next_param = None,
            NextParam::Repeated(error) => {
                return Err(self.fail_pagination(&mut progress, error));
            }
        }
        self.publish(&progress, None);
        debug!(
            key = %self.base_key,
            pages = progress.pages.len(),
            has_next_page = progress.next_param.is_some(),
            "Page appended"
        );
        Ok(FetchNextOutcome::Fetched)
    }

    /// Re-walk every fetched page from the initial param, bypassing freshness.
    async fn refetch(&self) -> QueryResult<()> {
        let Some((_op, walk)) = self.claim(true) else {
            return Ok(());
        };
        let count = mutex_lock(&self.progress, SOURCE, "refetch")
            .pages
            .len()
            .max(1);
        self.state.send_modify(|state| state.is_refetching = true);

        let mut pages = Vec::with_capacity(count);
        let mut params = Vec::with_capacity(count);
        let mut param = self.options.initial_page_param.clone();
        let mut outcome = Ok(());
        let mut next_param = None;

        for _ in 0..count {
            match self.fetch_page(&param, true).await {
                Ok(page) => pages.push(page),
                Err(error) => {
                    outcome = Err(error);
                    break;
                }
            }
            params.push(param.clone());
            match self.next_param(&param, &pages) {
                NextParam::Continue(next) => {
                    next_param = Some(next.clone());
                    param = next;
                }
                NextParam::Done => {
                    next_param = None;
                    break;
                }
                NextParam::Repeated(error) => {
                    outcome = Err(QueryError::from(error));
                    break;
                }
            }
        }

        let mut progress = mutex_lock(&self.progress, SOURCE, "refetch.apply");
        if progress.walk != walk {
            return Ok(());
        }
        match outcome {
            Ok(()) => {
                progress.pages = pages;
                progress.params = params;
                progress.next_param = next_param;
                self.publish(&progress, None);
                info!(key = %self.base_key, pages = progress.pages.len(), "Pages refetched");
                Ok(())
            }
            Err(QueryError::Configuration(error)) => {
                Err(self.fail_pagination(&mut progress, error))
            }
            Err(error) => {
                // Keep the previous pages visible.
                self.publish(&progress, Some(error.clone()));
                Err(error)
            }
        }
    }
}

fn on_page_change(inner: &Weak<InfiniteInner>, event: &ChangeEvent) {
    if !event.kind.requests_refresh() {
        return;
    }
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if !inner.options.query.enabled
        || mutex_lock(&inner.progress, SOURCE, "on_page_change")
            .pages
            .is_empty()
    {
        return;
    }
    // Several pages invalidated by one pattern collapse into one refetch.
    if inner.refresh_scheduled.swap(true, Ordering::SeqCst) {
        return;
    }
    let Ok(runtime) = Handle::try_current() else {
        inner.refresh_scheduled.store(false, Ordering::SeqCst);
        warn!(key = %inner.base_key, "No tokio runtime available; pages not refetched");
        return;
    };
    debug!(key = %inner.base_key, page = %event.key, "Pages invalidated; refetching");
    runtime.spawn(async move {
        tokio::task::yield_now().await;
        inner.refresh_scheduled.store(false, Ordering::SeqCst);
        if let Err(error) = inner.refetch().await {
            warn!(key = %inner.base_key, error = %error, "Background page refetch failed");
        }
    });
}

/// Handle to one paginated list. Dropping it stops invalidation tracking;
/// fetched pages stay cached.
pub struct InfiniteQuery {
    inner: Arc<InfiniteInner>,
    listener: ListenerId,
}

impl InfiniteQuery {
    pub fn base_key(&self) -> &QueryKey {
        &self.inner.base_key
    }

    /// Fetch the page after the last one.
    ///
    /// Returns immediately with `AlreadyFetching` or `NoMorePages` when there
    /// is nothing to do. A repeated cursor ends pagination with a
    /// configuration error.
    #[instrument(skip(self), fields(key = %self.inner.base_key))]
    pub async fn fetch_next_page(&self) -> QueryResult<FetchNextOutcome> {
        self.inner.fetch_next_page().await
    }

    pub async fn refetch(&self) -> QueryResult<()> {
        self.inner.refetch().await
    }

    pub fn has_next_page(&self) -> bool {
        self.inner.state.borrow().has_next_page
    }

    pub fn pages(&self) -> Vec<Arc<Value>> {
        self.inner.state.borrow().pages.clone()
    }

    pub fn flattened(&self) -> Vec<Value> {
        flatten(&self.inner.state.borrow().pages)
    }

    pub fn state(&self) -> InfiniteState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InfiniteState> {
        self.inner.state.subscribe()
    }

    /// Wait for the next state change observed by `receiver`.
    pub async fn changed(receiver: &mut watch::Receiver<InfiniteState>) -> Option<InfiniteState> {
        receiver.changed().await.ok()?;
        Some(receiver.borrow_and_update().clone())
    }
}

impl Drop for InfiniteQuery {
    fn drop(&mut self) {
        self.inner.queries.cache().remove_listener(self.listener);
    }
}

impl fmt::Debug for InfiniteQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfiniteQuery")
            .field("base_key", &self.inner.base_key)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::cache::{CacheConfig, CacheStore};
    use crate::query::RetryPolicy;
    use crate::tracker::GlobalStateTracker;

    fn coordinator() -> InfiniteQueryCoordinator {
        InfiniteQueryCoordinator::new(QueryCoordinator::new(
            Arc::new(CacheStore::new(CacheConfig::default())),
            Arc::new(GlobalStateTracker::new()),
        ))
    }

    fn key(raw: &str) -> QueryKey {
        QueryKey::new(raw).unwrap()
    }

    /// Pages `[n*10, n*10+1]` for params 0..3; page 1 is the slowest.
    fn numbered_pages(
        calls: &Arc<AtomicUsize>,
    ) -> impl Fn(Value) -> futures::future::BoxFuture<'static, Result<Value, FetchError>>
    + Send
    + Sync
    + 'static {
        let calls = Arc::clone(calls);
        move |param: Value| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let n = param.as_u64().unwrap_or_default();
                let latency = if n == 1 { 300 } else { 10 };
                tokio::time::sleep(Duration::from_millis(latency)).await;
                Ok(json!([n * 10, n * 10 + 1]))
            })
        }
    }

    fn three_pages() -> InfiniteQueryOptions {
        InfiniteQueryOptions::new(json!(0), |_, pages| {
            (pages.len() < 3).then(|| json!(pages.len()))
        })
    }

    #[tokio::test(start_paused = true)]
    async fn pages_are_appended_in_fetch_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = coordinator()
            .create(key("feed"), numbered_pages(&calls), three_pages())
            .unwrap();

        for _ in 0..3 {
            assert_eq!(query.fetch_next_page().await.unwrap(), FetchNextOutcome::Fetched);
        }

        assert_eq!(query.flattened(), vec![json!(0), json!(1), json!(10), json!(11), json!(20), json!(21)]);
        assert!(!query.has_next_page());
        assert_eq!(query.fetch_next_page().await.unwrap(), FetchNextOutcome::NoMorePages);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(query.state().page_params, vec![json!(0), json!(1), json!(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn opaque_cursors_with_spaces_page_through() {
        let coordinator = coordinator();
        let query = coordinator
            .create(
                key("events"),
                |param: Value| async move { Ok::<_, FetchError>(json!([param])) },
                InfiniteQueryOptions::new(json!("2024-01-01 00:00"), |_, pages| {
                    (pages.len() < 2).then(|| json!("2024-01-02 00:00"))
                }),
            )
            .unwrap();

        assert_eq!(query.fetch_next_page().await.unwrap(), FetchNextOutcome::Fetched);
        assert_eq!(query.fetch_next_page().await.unwrap(), FetchNextOutcome::Fetched);

        assert_eq!(
            query.flattened(),
            vec![json!("2024-01-01 00:00"), json!("2024-01-02 00:00")]
        );
        assert_eq!(coordinator.queries.invalidate("events:*").unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_next_page_is_a_no_op() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = coordinator()
            .create(key("feed"), numbered_pages(&calls), three_pages())
            .unwrap();

        let (first, second) = tokio::join!(query.fetch_next_page(), query.fetch_next_page());

        assert_eq!(first.unwrap(), FetchNextOutcome::Fetched);
        assert_eq!(second.unwrap(), FetchNextOutcome::AlreadyFetching);
        assert_eq!(query.pages().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pages_are_cached_under_child_keys() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = coordinator
            .create(key("feed"), numbered_pages(&calls), three_pages())
            .unwrap();

        query.fetch_next_page().await.unwrap();
        query.fetch_next_page().await.unwrap();

        let cache = coordinator.queries.cache();
        assert_eq!(cache.peek(&key("feed:0")), Some(Arc::new(json!([0, 1]))));
        assert_eq!(cache.peek(&key("feed:1")), Some(Arc::new(json!([10, 11]))));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_cursor_terminates_pagination() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = InfiniteQueryOptions::new(json!(0), |_, _| Some(json!(0)));
        let query = coordinator
            .create(key("loop"), numbered_pages(&calls), options)
            .unwrap();

        let error = query.fetch_next_page().await.unwrap_err();

        assert!(error.is_configuration());
        assert!(!query.has_next_page());
        assert_eq!(query.pages().len(), 1);
        assert_eq!(query.fetch_next_page().await.unwrap(), FetchNextOutcome::NoMorePages);
        assert!(coordinator.queries.tracker().error_for("loop").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_page_keeps_earlier_pages() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let fetcher = move |param: Value| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if param == json!(1) {
                    Err(FetchError::new("page unavailable"))
                } else {
                    Ok(json!(["first"]))
                }
            }
        };
        let options = three_pages().query(QueryOptions::default().retry(RetryPolicy::none()));
        let query = coordinator().create(key("feed"), fetcher, options).unwrap();

        query.fetch_next_page().await.unwrap();
        let error = query.fetch_next_page().await.unwrap_err();

        assert!(matches!(error, QueryError::Fetch(_)));
        let state = query.state();
        assert_eq!(state.pages.len(), 1);
        assert!(state.has_next_page);
        assert!(state.error.is_some());
        assert!(!state.is_fetching_next_page);
    }

    #[tokio::test(start_paused = true)]
    async fn refetch_rewalks_every_page() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = coordinator()
            .create(key("feed"), numbered_pages(&calls), three_pages())
            .unwrap();
        query.fetch_next_page().await.unwrap();
        query.fetch_next_page().await.unwrap();

        query.refetch().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(query.pages().len(), 2);
        assert!(query.has_next_page());
    }

    #[tokio::test(start_paused = true)]
    async fn invalidating_the_base_key_refetches_all_pages() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = coordinator
            .create(key("feed"), numbered_pages(&calls), three_pages())
            .unwrap();
        query.fetch_next_page().await.unwrap();
        query.fetch_next_page().await.unwrap();
        let mut updates = query.subscribe();
        updates.borrow_and_update();

        let removed = coordinator.queries.invalidate("feed:*").unwrap();
        assert_eq!(removed, 2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(query.pages().len(), 2);
        assert!(coordinator.queries.cache().peek(&key("feed:1")).is_some());
        assert!(updates.has_changed().unwrap());
    }

    #[tokio::test]
    async fn dropping_the_query_removes_its_listener() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = coordinator
            .create(key("feed"), numbered_pages(&calls), three_pages())
            .unwrap();
        assert_eq!(coordinator.queries.cache().listener_count(), 1);

        drop(query);
        assert_eq!(coordinator.queries.cache().listener_count(), 0);
    }
}
