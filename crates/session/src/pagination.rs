//! Offset/limit pagination over XNAT listing endpoints.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::debug;

use crate::client::SessionClient;
use crate::error::SessionError;

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Where XNAT puts listing rows.
pub const DEFAULT_RESULT_KEY: &str = "ResultSet.Result";

/// Lazily fetches pages and yields one item at a time.
///
/// A page shorter than the page size (including an empty one) ends the
/// iteration. A failed page fetch is returned as an error rather than
/// ending the sequence early.
pub struct Paginator {
    client: SessionClient,
    path: String,
    params: Vec<(String, String)>,
    result_key: String,
    page_size: usize,
    offset: usize,
    buffer: VecDeque<Value>,
    exhausted: bool,
    pages_fetched: usize,
}

impl Paginator {
    pub fn new(client: &SessionClient, path: impl Into<String>) -> Self {
        Self {
            client: client.clone(),
            path: path.into(),
            params: Vec::new(),
            result_key: DEFAULT_RESULT_KEY.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            offset: 0,
            buffer: VecDeque::new(),
            exhausted: false,
            pages_fetched: 0,
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Dotted path to the result array, e.g. `ResultSet.Result`.
    pub fn result_key(mut self, key: impl Into<String>) -> Self {
        self.result_key = key.into();
        self
    }

    /// Extra query parameter sent with every page.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Next item, fetching another page when the buffer runs dry.
    pub async fn next(&mut self) -> Result<Option<Value>, SessionError> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        Ok(self.buffer.pop_front())
    }

    /// Drains every remaining item.
    pub async fn try_collect(mut self) -> Result<Vec<Value>, SessionError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    async fn fetch_page(&mut self) -> Result<(), SessionError> {
        let mut params = self.params.clone();
        params.push(("format".into(), "json".into()));
        params.push(("offset".into(), self.offset.to_string()));
        params.push(("limit".into(), self.page_size.to_string()));

        let value = self.client.get_json(&self.path, &params).await?;
        let page = extract_results(&value, &self.result_key);
        self.pages_fetched += 1;

        debug!(path = %self.path, offset = self.offset, items = page.len(), "fetched page");

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.offset += page.len();
        self.buffer.extend(page);
        Ok(())
    }
}

/// Follows a dotted key path and returns the array found there.
///
/// A missing key or a non-array value yields an empty list.
pub fn extract_results(value: &Value, key_path: &str) -> Vec<Value> {
    let mut current = value;
    for key in key_path.split('.').filter(|k| !k.is_empty()) {
        match current.get(key) {
            Some(next) => current = next,
            None => return Vec::new(),
        }
    }
    current.as_array().cloned().unwrap_or_default()
}
