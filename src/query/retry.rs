use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tracing::warn;

use super::options::RetryPolicy;
use crate::error::{QueryError, QueryResult};

pub(crate) const METRIC_RETRY: &str = "reactive_query_fetch_retry_total";

/// Run `attempt` until it succeeds, fails with a non-retryable error, or the
/// policy's retries are exhausted. Each attempt is bounded by `timeout`.
pub(crate) async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Option<Duration>,
    operation: &'static str,
    label: &str,
    mut attempt: F,
) -> QueryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = QueryResult<T>>,
{
    let mut retries = 0;
    loop {
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, attempt())
                .await
                .unwrap_or(Err(QueryError::Timeout { after: limit })),
            None => attempt().await,
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && retries < policy.max_attempts => {
                let delay = policy.delay_for(retries);
                retries += 1;
                warn!(
                    operation,
                    label,
                    retry = retries,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed; retrying"
                );
                counter!(METRIC_RETRY, "operation" => operation).increment(1);
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}
