use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::FetchError;

/// Zero-argument async producer of a query value.
///
/// Implemented for any `Fn() -> impl Future<Output = Result<Value, FetchError>>`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self) -> Result<Value, FetchError>;
}

#[async_trait]
impl<F, Fut> Fetcher for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
{
    async fn fetch(&self) -> Result<Value, FetchError> {
        (self)().await
    }
}

/// Adapts a fetcher producing any `Serialize` type.
pub struct JsonFetcher<F, T> {
    inner: F,
    _output: PhantomData<fn() -> T>,
}

/// Wrap a typed fetch function so its output is stored as JSON.
pub fn json_fetcher<F, Fut, T>(inner: F) -> JsonFetcher<F, T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    JsonFetcher {
        inner,
        _output: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, T> Fetcher for JsonFetcher<F, T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    async fn fetch(&self) -> Result<Value, FetchError> {
        let typed = (self.inner)().await?;
        serde_json::to_value(typed).map_err(FetchError::from_error)
    }
}
