//! Mutation coordinator.
//!
//! Runs write operations with optimistic cache patches. Mutations whose
//! patches touch the same keys are serialized; the patch is applied once per
//! call, before the mutate function runs, and is either rolled back or
//! confirmed before the call resolves.

use std::collections::HashMap;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use metrics::counter;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, watch};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::descriptor::MutationDescriptor;
use super::rollback::{CachePatch, OptimisticUpdate, Rollback};
use crate::cache::{CacheStore, EntryTtl, KeyPattern, QueryKey, mutex_lock};
use crate::error::{MutationError, QueryError, QueryResult};
use crate::query::run_with_retry;
use crate::tracker::GlobalStateTracker;

const SOURCE: &str = "mutation::coordinator";

pub(crate) const METRIC_ROLLBACK: &str = "reactive_query_mutation_rollback_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Succeeded,
    Failed,
}

/// One invocation of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationExecution {
    pub id: Uuid,
    pub status: ExecutionStatus,
    /// The optimistic patch was undone.
    pub rolled_back: bool,
    pub started_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
}

/// What a mutation call site sees.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationState {
    pub is_loading: bool,
    /// Executions from this handle still running.
    pub pending: usize,
    /// Error of the most recently settled execution.
    pub error: Option<QueryError>,
    pub last_execution: Option<MutationExecution>,
}

impl MutationState {
    fn start(&mut self, id: Uuid) {
        self.pending += 1;
        self.is_loading = true;
        self.last_execution = Some(MutationExecution {
            id,
            status: ExecutionStatus::Pending,
            rolled_back: false,
            started_at: OffsetDateTime::now_utc(),
            finished_at: None,
        });
    }

    fn finish(&mut self, id: Uuid, outcome: Result<(), &QueryError>, rolled_back: bool) {
        self.pending = self.pending.saturating_sub(1);
        self.is_loading = self.pending > 0;
        self.error = outcome.err().cloned();
        if let Some(execution) = self.last_execution.as_mut().filter(|execution| execution.id == id) {
            execution.status = match outcome {
                Ok(()) => ExecutionStatus::Succeeded,
                Err(_) => ExecutionStatus::Failed,
            };
            execution.rolled_back = rolled_back;
            execution.finished_at = Some(OffsetDateTime::now_utc());
        }
    }
}

/// Patch applied for one execution.
struct Applied {
    rollback: Rollback,
    /// Keys written by the patch and the generation each write produced.
    written: Vec<(QueryKey, u64)>,
}

struct Settled<R> {
    result: QueryResult<R>,
    rolled_back: bool,
}

struct MutationInner {
    cache: Arc<CacheStore>,
    tracker: Arc<GlobalStateTracker>,
    key_locks: Mutex<HashMap<QueryKey, Arc<AsyncMutex<()>>>>,
}

/// Executes mutations; cheap to clone.
#[derive(Clone)]
pub struct MutationCoordinator {
    inner: Arc<MutationInner>,
}

impl MutationCoordinator {
    pub fn new(cache: Arc<CacheStore>, tracker: Arc<GlobalStateTracker>) -> Self {
        Self {
            inner: Arc::new(MutationInner {
                cache,
                tracker,
                key_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.inner.cache
    }

    /// Bind a descriptor to this coordinator for one call site.
    pub fn handle<V, R>(&self, descriptor: MutationDescriptor<V, R>) -> MutationHandle<V, R> {
        MutationHandle {
            descriptor: Arc::new(descriptor),
            inner: Arc::clone(&self.inner),
            state: Arc::new(watch::Sender::new(MutationState::default())),
        }
    }

    /// Keys currently locked or awaited by running mutations.
    pub fn contended_keys(&self) -> usize {
        mutex_lock(&self.inner.key_locks, SOURCE, "contended_keys").len()
    }
}

/// Per-key locks held for the duration of one execution.
struct KeyLocks {
    inner: Arc<MutationInner>,
    keys: Vec<QueryKey>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl Drop for KeyLocks {
    fn drop(&mut self) {
        self.guards.clear();
        let mut locks = mutex_lock(&self.inner.key_locks, SOURCE, "release_keys");
        for key in &self.keys {
            if locks
                .get(key)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                locks.remove(key);
            }
        }
    }
}

impl MutationInner {
    /// Lock `keys` (sorted, unique) in order.
    async fn lock_keys(self: &Arc<Self>, keys: Vec<QueryKey>) -> KeyLocks {
        let pending: Vec<Arc<AsyncMutex<()>>> = {
            let mut locks = mutex_lock(&self.key_locks, SOURCE, "lock_keys");
            keys.iter()
                .map(|key| Arc::clone(locks.entry(key.clone()).or_default()))
                .collect()
        };

        let mut held = KeyLocks {
            inner: Arc::clone(self),
            keys,
            guards: Vec::with_capacity(pending.len()),
        };
        for lock in pending {
            held.guards.push(lock.lock_owned().await);
        }
        held
    }

    fn apply_optimistic(&self, update: OptimisticUpdate) -> QueryResult<Applied> {
        let ttl: EntryTtl = self.cache.default_ttl()?;
        let mut rollback = match update.rollback {
            Some(rollback) => rollback,
            None => Rollback::capture(&self.cache, update.patches.iter().map(CachePatch::key)),
        };

        let mut written: Vec<(QueryKey, u64)> = Vec::new();
        for patch in update.patches {
            match patch {
                CachePatch::Set { key, value } => {
                    let (generation, evicted) =
                        self.cache.set_evicting(key.clone(), Arc::new(value), ttl);
                    if let Some(evicted) = evicted {
                        rollback.record_evicted(evicted);
                    }
                    written.retain(|(written_key, _)| *written_key != key);
                    written.push((key, generation));
                }
                CachePatch::Delete { key } => {
                    self.cache.delete(&key);
                    written.retain(|(written_key, _)| *written_key != key);
                }
            }
        }
        Ok(Applied { rollback, written })
    }

    /// Invalidate optimistic writes nobody has overwritten since.
    fn confirm(&self, applied: &Applied) {
        for (key, generation) in &applied.written {
            if self.cache.generation_of(key) == Some(*generation) {
                self.cache.invalidate_matching(&KeyPattern::exact(key));
            }
        }
    }

    fn roll_back(&self, name: &str, id: Uuid, rollback: &Rollback) {
        rollback.apply(&self.cache);
        counter!(METRIC_ROLLBACK, "mutation" => name.to_string()).increment(1);
        warn!(
            mutation = name,
            execution = %id,
            rollback = rollback.kind(),
            "Optimistic update rolled back"
        );
    }

    async fn execute<V, R>(
        self: &Arc<Self>,
        descriptor: &MutationDescriptor<V, R>,
        variables: V,
        id: Uuid,
    ) -> Settled<R>
    where
        V: Clone + Send + Sync + 'static,
        R: Send + 'static,
    {
        let name = descriptor.name.as_str();
        self.tracker.begin_mutation();
        info!(mutation = name, execution = %id, "Mutation started");

        let mut locks = None;
        let mut applied = None;
        if let Some(optimistic) = &descriptor.optimistic {
            let keys = optimistic(&variables, &self.cache).keys();
            locks = Some(self.lock_keys(keys.clone()).await);

            // Recomputed under the locks so it builds on settled data.
            let update = optimistic(&variables, &self.cache);
            if update.keys().iter().any(|key| !keys.contains(key)) {
                warn!(mutation = name, "Optimistic patch touches keys it did not lock");
            }
            match self.apply_optimistic(update) {
                Ok(patch) => {
                    debug!(mutation = name, execution = %id, keys = patch.written.len(), "Optimistic patch applied");
                    applied = Some(patch);
                }
                Err(error) => {
                    self.tracker.finish_mutation(name, Err(&error));
                    return Settled {
                        result: Err(error),
                        rolled_back: false,
                    };
                }
            }
        }

        let attempts = run_with_retry(&descriptor.retry, None, "mutation", name, || {
            let pending = (descriptor.mutate)(variables.clone());
            async move { pending.await.map_err(QueryError::from) }
        });
        let result = match AssertUnwindSafe(attempts).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                error!(mutation = name, execution = %id, "Mutate function panicked");
                Err(QueryError::from(MutationError::new(
                    name,
                    format!("mutate function panicked: {}", panic_message(panic.as_ref())),
                )))
            }
        };

        let mut rolled_back = false;
        match &result {
            Ok(value) => {
                if let Some(on_success) = &descriptor.on_success {
                    on_success(value, &variables, &self.cache);
                }
                if let Some(applied) = &applied {
                    self.confirm(applied);
                }
                info!(mutation = name, execution = %id, "Mutation succeeded");
            }
            Err(error) => {
                if let Some(applied) = &applied {
                    self.roll_back(name, id, &applied.rollback);
                    rolled_back = true;
                }
                if let Some(on_error) = &descriptor.on_error {
                    on_error(error, &variables);
                }
                warn!(mutation = name, execution = %id, error = %error, "Mutation failed");
            }
        }

        self.tracker
            .finish_mutation(name, result.as_ref().map(|_| ()));
        drop(locks);
        Settled {
            result,
            rolled_back,
        }
    }
}

/// A mutation bound to one call site.
pub struct MutationHandle<V, R> {
    descriptor: Arc<MutationDescriptor<V, R>>,
    inner: Arc<MutationInner>,
    state: Arc<watch::Sender<MutationState>>,
}

impl<V, R> Clone for MutationHandle<V, R> {
    fn clone(&self) -> Self {
        Self {
            descriptor: Arc::clone(&self.descriptor),
            inner: Arc::clone(&self.inner),
            state: Arc::clone(&self.state),
        }
    }
}

impl<V, R> MutationHandle<V, R>
where
    V: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn state(&self) -> MutationState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MutationState> {
        self.state.subscribe()
    }

    /// Run the mutation once with `variables`.
    ///
    /// The execution runs on its own task, so dropping the returned future
    /// does not leave an optimistic patch behind.
    #[instrument(skip_all, fields(mutation = %self.descriptor.name))]
    pub async fn mutate(&self, variables: V) -> QueryResult<R> {
        let id = Uuid::new_v4();
        self.state.send_modify(|state| state.start(id));

        let inner = Arc::clone(&self.inner);
        let descriptor = Arc::clone(&self.descriptor);
        let state = Arc::clone(&self.state);
        let task = tokio::spawn(async move {
            let settled = inner.execute(&descriptor, variables, id).await;
            state.send_modify(|state| {
                state.finish(id, settled.result.as_ref().map(|_| ()), settled.rolled_back)
            });
            settled.result
        });

        match task.await {
            Ok(result) => result,
            Err(err) => {
                let error = QueryError::from(MutationError::new(
                    self.descriptor.name.clone(),
                    format!("mutation task failed: {err}"),
                ));
                self.inner
                    .tracker
                    .finish_mutation(&self.descriptor.name, Err(&error));
                self.state
                    .send_modify(|state| state.finish(id, Err(&error), false));
                Err(error)
            }
        }
    }
}

impl<V, R> fmt::Debug for MutationHandle<V, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationHandle")
            .field("descriptor", &self.descriptor)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Convenience for optimistic functions: the cached value of `key`, or `Null`.
pub fn cached_or_null(cache: &CacheStore, key: &QueryKey) -> Value {
    cache
        .peek(key)
        .map(|value| value.as_ref().clone())
        .unwrap_or(Value::Null)
}
