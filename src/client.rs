//! Dependency container wiring one cache, one tracker and the coordinators.

use std::sync::Arc;

use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::cache::{CacheStore, QueryKey};
use crate::config::EngineConfig;
use crate::error::QueryResult;
use crate::infinite::InfiniteQueryCoordinator;
use crate::mutation::MutationCoordinator;
use crate::query::{
    FeaturePolicy, Fetcher, QueryCoordinator, QueryDescriptor, QueryHandle, QueryOptions,
};
use crate::tracker::GlobalStateTracker;

/// Entry point for consumers. Cheap to clone.
#[derive(Clone)]
pub struct QueryClient {
    config: Arc<EngineConfig>,
    cache: Arc<CacheStore>,
    tracker: Arc<GlobalStateTracker>,
    queries: QueryCoordinator,
    mutations: MutationCoordinator,
    infinite: InfiniteQueryCoordinator,
}

impl QueryClient {
    /// Build the engine. The expiry sweeper only starts when called from
    /// inside a tokio runtime.
    pub fn new(config: EngineConfig) -> Self {
        let cache = Arc::new(CacheStore::new(config.cache.clone()));
        if Handle::try_current().is_ok() {
            cache.spawn_sweeper();
        } else {
            warn!("No tokio runtime; cache sweeper not started");
        }

        let tracker = Arc::new(GlobalStateTracker::new());
        let queries = QueryCoordinator::new(Arc::clone(&cache), Arc::clone(&tracker));
        let mutations = MutationCoordinator::new(Arc::clone(&cache), Arc::clone(&tracker));
        let infinite = InfiniteQueryCoordinator::new(queries.clone());

        info!(
            max_entries = config.cache.max_entries,
            features = config.features.len(),
            "Query client initialized"
        );

        Self {
            config: Arc::new(config),
            cache,
            tracker,
            queries,
            mutations,
            infinite,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn tracker(&self) -> &Arc<GlobalStateTracker> {
        &self.tracker
    }

    pub fn queries(&self) -> &QueryCoordinator {
        &self.queries
    }

    pub fn mutations(&self) -> &MutationCoordinator {
        &self.mutations
    }

    pub fn infinite(&self) -> &InfiniteQueryCoordinator {
        &self.infinite
    }

    pub fn policy(&self, feature: &str) -> &FeaturePolicy {
        self.config.policy(feature)
    }

    pub fn options(&self, feature: &str) -> QueryOptions {
        self.config.query_options(feature)
    }

    /// Subscribe to `key` using the options configured for `feature`.
    pub fn query<F>(&self, feature: &str, key: QueryKey, fetcher: F) -> QueryResult<QueryHandle>
    where
        F: Fetcher + 'static,
    {
        let descriptor = QueryDescriptor::new(key, fetcher).options(self.options(feature));
        self.queries.subscribe(descriptor)
    }

    /// Non-reactive read, warning when older than the feature's cache time.
    pub fn get_query_data(&self, feature: &str, key: &QueryKey) -> Option<Arc<Value>> {
        self.queries
            .get_query_data(key, self.policy(feature).cache_time())
    }

    pub fn invalidate(&self, pattern: &str) -> QueryResult<usize> {
        self.queries.invalidate(pattern)
    }

    /// Tear down observers, in-flight fetches, cached data and listeners.
    pub fn dispose(&self) {
        self.queries.dispose();
        self.cache.dispose();
        self.tracker.reset();
        info!("Query client disposed");
    }
}
