use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use super::rollback::OptimisticUpdate;
use crate::cache::CacheStore;
use crate::error::{MutationError, QueryError};
use crate::query::RetryPolicy;

pub(crate) type MutateFn<V, R> =
    Arc<dyn Fn(V) -> BoxFuture<'static, Result<R, MutationError>> + Send + Sync>;
pub(crate) type OptimisticFn<V> = Arc<dyn Fn(&V, &CacheStore) -> OptimisticUpdate + Send + Sync>;
pub(crate) type SuccessFn<V, R> = Arc<dyn Fn(&R, &V, &CacheStore) + Send + Sync>;
pub(crate) type ErrorFn<V> = Arc<dyn Fn(&QueryError, &V) + Send + Sync>;

/// A write operation and its cache side effects, built once per call site.
///
/// The optimistic function must be pure: it may be evaluated more than once
/// per call, but its patch is applied exactly once.
pub struct MutationDescriptor<V, R> {
    pub(crate) name: String,
    pub(crate) mutate: MutateFn<V, R>,
    pub(crate) optimistic: Option<OptimisticFn<V>>,
    pub(crate) on_success: Option<SuccessFn<V, R>>,
    pub(crate) on_error: Option<ErrorFn<V>>,
    pub(crate) retry: RetryPolicy,
}

impl<V, R> MutationDescriptor<V, R>
where
    V: Send + 'static,
    R: Send + 'static,
{
    pub fn new<F, Fut>(name: impl Into<String>, mutate: F) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, MutationError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            mutate: Arc::new(move |variables| mutate(variables).boxed()),
            optimistic: None,
            on_success: None,
            on_error: None,
            retry: RetryPolicy::none(),
        }
    }

    pub fn optimistic<F>(mut self, optimistic: F) -> Self
    where
        F: Fn(&V, &CacheStore) -> OptimisticUpdate + Send + Sync + 'static,
    {
        self.optimistic = Some(Arc::new(optimistic));
        self
    }

    /// Runs after success, before the mutation resolves. Typically writes
    /// the server result or invalidates related keys.
    pub fn on_success<F>(mut self, on_success: F) -> Self
    where
        F: Fn(&R, &V, &CacheStore) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(on_success));
        self
    }

    /// Runs after the rollback has been applied.
    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&QueryError, &V) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<V, R> fmt::Debug for MutationDescriptor<V, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationDescriptor")
            .field("name", &self.name)
            .field("optimistic", &self.optimistic.is_some())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
