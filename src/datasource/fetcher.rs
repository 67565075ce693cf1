use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::credentials::CredentialCache;
use super::error::{DataSourceError, FetchError};
use super::snapshot::{Record, TableSnapshot};
use crate::config::{Config, FetchPolicy};

/// Which page of the table to read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub page_size: Option<u32>,
    pub page_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    pub records: Vec<Record>,
    pub has_more: bool,
    pub page_token: Option<String>,
}

/// The raw, token-gated record listing call.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn list_records(&self, token: &str, page: &PageRequest) -> Result<RecordPage, DataSourceError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Attempt `n` is followed by a pause of `n * backoff`
    pub backoff: Duration,
    pub request_timeout: Duration,
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Reads table snapshots through the credential cache, retrying transient failures.
pub struct DataFetcher {
    credentials: Arc<CredentialCache>,
    source: Arc<dyn RecordSource>,
    retry: RetryPolicy,
    policy: FetchPolicy,
    page_size: u32,
    max_pages: u32,
}

impl DataFetcher {
    pub fn new(credentials: Arc<CredentialCache>, source: Arc<dyn RecordSource>) -> Self {
        Self {
            credentials,
            source,
            retry: RetryPolicy::default(),
            policy: FetchPolicy::default(),
            page_size: 500,
            max_pages: 10,
        }
    }

    pub fn from_config(
        credentials: Arc<CredentialCache>,
        source: Arc<dyn RecordSource>,
        config: &Config,
    ) -> Self {
        Self::new(credentials, source)
            .with_retry(RetryPolicy {
                max_attempts: config.fetch.max_attempts,
                backoff: config.fetch.backoff(),
                request_timeout: config.fetch.request_timeout(),
            })
            .with_policy(config.fetch.policy)
            .with_paging(config.bitable.page_size, config.bitable.max_pages)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_policy(mut self, policy: FetchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_paging(mut self, page_size: u32, max_pages: u32) -> Self {
        self.page_size = page_size;
        self.max_pages = max_pages.max(1);
        self
    }

    /// Fetch a fresh snapshot.
    ///
    /// `Some(page)` reads exactly that page; `None` walks every page up to
    /// the configured page limit. Data source failures are degraded to an
    /// empty snapshot under `FetchPolicy::Degrade`; auth failures always
    /// propagate.
    pub async fn fetch_table(&self, pagination: Option<PageRequest>) -> Result<TableSnapshot, FetchError> {
        let result = match pagination {
            Some(page) => self.fetch_page(&page).await.map(|p| p.records),
            None => self.fetch_all().await,
        };

        match result {
            Ok(records) => {
                let snapshot = TableSnapshot::from_records(records);
                debug!(
                    "Fetched table snapshot: {} records, {} columns",
                    snapshot.len(),
                    snapshot.columns().len()
                );
                Ok(snapshot)
            }
            Err(FetchError::DataSource(e)) if self.policy == FetchPolicy::Degrade => {
                warn!("Data source unavailable, continuing with an empty snapshot: {}", e);
                Ok(TableSnapshot::empty())
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_all(&self) -> Result<Vec<Record>, FetchError> {
        let mut records = Vec::new();
        let mut request = PageRequest {
            page_size: Some(self.page_size),
            page_token: None,
        };

        for page_no in 1..=self.max_pages {
            let page = self.fetch_page(&request).await?;
            records.extend(page.records);

            match (page.has_more, page.page_token) {
                (true, Some(token)) if !token.is_empty() => {
                    if page_no == self.max_pages {
                        warn!(
                            "Table has more than {} pages; truncating snapshot at {} records",
                            self.max_pages,
                            records.len()
                        );
                        break;
                    }
                    request.page_token = Some(token);
                }
                _ => break,
            }
        }

        Ok(records)
    }

    async fn fetch_page(&self, page: &PageRequest) -> Result<RecordPage, FetchError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let token = self.credentials.get_token().await?;

            let outcome = match tokio::time::timeout(
                self.retry.request_timeout,
                self.source.list_records(token.value(), page),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(DataSourceError::Timeout(self.retry.request_timeout)),
            };

            let err = match outcome {
                Ok(page) => return Ok(page),
                Err(e) => e,
            };

            if matches!(err, DataSourceError::TokenRejected(_)) {
                self.credentials.invalidate().await;
            }

            if !err.is_transient() {
                return Err(err.into());
            }

            if attempt >= max_attempts {
                return Err(DataSourceError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                }
                .into());
            }

            let delay = self.retry.delay_after(attempt);
            warn!(
                "Data source attempt {}/{} failed: {}. Retrying in {:?}",
                attempt, max_attempts, err, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
