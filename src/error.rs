use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Error produced by a fetcher. Triggers the retry policy.
#[derive(Debug, Clone, Error)]
#[error("fetch failed: {message}")]
pub struct FetchError {
    message: String,
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn from_error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: error.to_string(),
            source: Some(Arc::new(error)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl PartialEq for FetchError {
    fn eq(&self, other: &Self) -> bool {
        self.message == other.message
    }
}

/// Error produced by a mutate function. Rolls back the optimistic patch before surfacing.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("mutation `{mutation}` failed: {message}")]
pub struct MutationError {
    pub mutation: String,
    pub message: String,
}

impl MutationError {
    pub fn new(mutation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            mutation: mutation.into(),
            message: message.into(),
        }
    }
}

/// Programming mistakes raised synchronously and never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("invalid cache key `{key}`: {reason}")]
    InvalidKey { key: String, reason: String },
    #[error("invalid key pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("invalid ttl: {reason}")]
    InvalidTtl { reason: String },
    #[error("next page param for `{key}` repeats the previous cursor `{param}`")]
    RepeatedCursor { key: String, param: String },
}

/// Everything the engine surfaces to consumers, either as data or synchronously.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueryError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("operation timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("operation was cancelled")]
    Cancelled,
}

impl QueryError {
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch(FetchError::new(message))
    }

    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration(ConfigurationError::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        })
    }

    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration(ConfigurationError::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        })
    }

    pub fn invalid_ttl(reason: impl Into<String>) -> Self {
        Self::Configuration(ConfigurationError::InvalidTtl {
            reason: reason.into(),
        })
    }

    /// Whether the retry policy applies to this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueryError::Fetch(_) | QueryError::Mutation(_) | QueryError::Timeout { .. }
        )
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, QueryError::Configuration(_))
    }
}

pub type QueryResult<T> = Result<T, QueryError>;
