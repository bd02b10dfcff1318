use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::QueryError;

/// What a subscribed consumer sees for one key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryState {
    /// Last successfully fetched (or cached) value. Survives failed refetches.
    pub data: Option<Arc<Value>>,
    /// Fetching with nothing to show yet.
    pub is_loading: bool,
    /// Any fetch for the key is in flight, including background refreshes.
    pub is_fetching: bool,
    pub is_stale: bool,
    /// Terminal error of the most recent fetch, cleared by the next success.
    pub error: Option<QueryError>,
    pub updated_at: Option<Instant>,
}

impl QueryState {
    pub fn is_success(&self) -> bool {
        self.data.is_some() && self.error.is_none()
    }

    /// Deserialize `data` into `T`; `None` when absent or mismatched.
    pub fn data_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.data
            .as_deref()
            .and_then(|value| T::deserialize(value).ok())
    }

    pub(crate) fn start_fetching(&mut self) {
        self.is_fetching = true;
        self.is_loading = self.data.is_none();
    }

    pub(crate) fn settle_ok(&mut self, value: Arc<Value>) {
        self.data = Some(value);
        self.error = None;
        self.is_fetching = false;
        self.is_loading = false;
        self.is_stale = false;
        self.updated_at = Some(Instant::now());
    }

    pub(crate) fn settle_err(&mut self, error: QueryError) {
        self.error = Some(error);
        self.is_fetching = false;
        self.is_loading = false;
    }

    pub(crate) fn abandon(&mut self) {
        self.is_fetching = false;
        self.is_loading = false;
    }
}
