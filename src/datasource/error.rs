use std::time::Duration;
use thiserror::Error;

/// The credential exchange failed. Never retried by the cache itself.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Auth request failed: {0}")]
    Request(String),

    #[error("Auth rejected (code {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("Malformed auth response: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum DataSourceError {
    #[error("Data source request failed: {0}")]
    Request(String),

    #[error("Data source request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Data source returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Data source rejected the access token: {0}")]
    TokenRejected(String),

    #[error("Data source error (code {code}): {message}")]
    Api { code: i64, message: String },

    #[error("Malformed data source response: {0}")]
    Malformed(String),

    #[error("Data source unavailable after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<DataSourceError>,
    },
}

impl DataSourceError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DataSourceError::Request(_)
            | DataSourceError::Timeout(_)
            | DataSourceError::TokenRejected(_) => true,
            DataSourceError::Http { status, .. } => *status >= 500 || *status == 429,
            DataSourceError::Api { .. }
            | DataSourceError::Malformed(_)
            | DataSourceError::Exhausted { .. } => false,
        }
    }
}

/// Error returned by `DataFetcher::fetch_table`.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    DataSource(#[from] DataSourceError),
}
