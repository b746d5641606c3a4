//! Search/fetch collaborator contract and a bounded wrapper around it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::config::FetchConfig;

#[cfg(feature = "http-fetch")]
mod http;
#[cfg(feature = "http-fetch")]
pub use http::HttpFetcher;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageLink {
    pub url: String,
    #[serde(default)]
    pub text: String,
}

/// Extracted page content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageData {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub links: Vec<PageLink>,
    #[serde(default)]
    pub tables: Vec<Vec<Vec<String>>>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl PageData {
    pub fn failed(url: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Web search and page retrieval.
#[async_trait]
pub trait WebFetcher: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> anyhow::Result<Vec<SearchHit>>;

    async fn fetch(&self, url: &str) -> anyhow::Result<PageData>;
}

pub type DynWebFetcher = Arc<dyn WebFetcher>;

/// Adds a concurrency cap, a per-call timeout and bounded retry on top of any fetcher.
///
/// Transport errors and timeouts are retried with exponential backoff. A fetch
/// that still fails comes back as an unsuccessful [`PageData`] rather than an
/// error, so one bad page never fails the caller.
pub struct BoundedFetcher {
    inner: DynWebFetcher,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    max_retries: usize,
    initial_backoff_ms: u64,
}

impl BoundedFetcher {
    pub fn new(inner: DynWebFetcher, config: &FetchConfig) -> Self {
        Self {
            inner,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_fetches.max(1))),
            timeout: Duration::from_millis(config.timeout_ms),
            max_retries: config.max_retries,
            initial_backoff_ms: config.initial_backoff_ms,
        }
    }

    async fn attempt<T, F, Fut>(&self, what: &str, target: &str, op: F) -> anyhow::Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0;
        let mut backoff_ms = self.initial_backoff_ms;

        loop {
            let result = {
                let _permit = self.semaphore.acquire().await?;
                match tokio::time::timeout(self.timeout, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!(
                        "{what} timed out after {}ms",
                        self.timeout.as_millis()
                    )),
                }
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::debug!(
                        target_url = %target,
                        error = %err,
                        attempt,
                        backoff_ms,
                        "{what} failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl WebFetcher for BoundedFetcher {
    async fn search(&self, query: &str, max_results: usize) -> anyhow::Result<Vec<SearchHit>> {
        self.attempt("search", query, || self.inner.search(query, max_results))
            .await
    }

    async fn fetch(&self, url: &str) -> anyhow::Result<PageData> {
        match self.attempt("fetch", url, || self.inner.fetch(url)).await {
            Ok(page) => Ok(page),
            Err(err) => {
                tracing::debug!(url = %url, error = %err, "giving up on page");
                Ok(PageData::failed(url, format!("{err:#}")))
            }
        }
    }
}
