//! Single-value queries: fetchers, options, per-key state and the
//! coordinator that de-duplicates and refreshes them.

mod coordinator;
mod fetcher;
mod options;
mod retry;
mod state;

pub use coordinator::{QueryCoordinator, QueryDescriptor, QueryHandle, SharedFetch};
pub use fetcher::{Fetcher, JsonFetcher, json_fetcher};
pub use options::{FeaturePolicy, QueryOptions, RetryPolicy};
pub use state::QueryState;

pub(crate) use coordinator::METRIC_FETCH_MS;
pub(crate) use retry::{METRIC_RETRY, run_with_retry};
