//! Reactive data fetching and caching.
//!
//! A [`CacheStore`] owns every cached value. The [`QueryCoordinator`]
//! de-duplicates fetches and keeps subscribers up to date, the
//! [`InfiniteQueryCoordinator`] layers cursor pagination on top, and the
//! [`MutationCoordinator`] applies optimistic writes with rollback. The
//! [`GlobalStateTracker`] aggregates loading and error state across all of
//! them. [`QueryClient`] wires the pieces together from an [`EngineConfig`].

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod infinite;
pub mod mutation;
pub mod query;
pub mod telemetry;
pub mod tracker;

pub use cache::{CacheConfig, CacheStore, KeyPattern, QueryKey};
pub use client::QueryClient;
pub use config::EngineConfig;
pub use error::{ConfigurationError, FetchError, MutationError, QueryError, QueryResult};
pub use infinite::{InfiniteQuery, InfiniteQueryCoordinator, InfiniteQueryOptions};
pub use mutation::{MutationCoordinator, MutationDescriptor, MutationHandle, OptimisticUpdate};
pub use query::{QueryCoordinator, QueryDescriptor, QueryHandle, QueryOptions, QueryState};
pub use tracker::{GlobalQueryState, GlobalStateTracker};
