pub mod bitable;
pub mod credentials;
pub mod error;
pub mod fetcher;
pub mod snapshot;

pub use bitable::{BitableClient, TenantTokenSource};
pub use credentials::{AccessToken, CredentialCache, TokenGrant, TokenSource};
pub use error::{AuthError, DataSourceError, FetchError};
pub use fetcher::{DataFetcher, PageRequest, RecordPage, RecordSource, RetryPolicy};
pub use snapshot::{Record, TableSnapshot};
