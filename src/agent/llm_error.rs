use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("API request failed: {0}")]
    ApiRequestFailed(#[from] reqwest::Error),

    #[error("Provider error {status}: {message}")]
    ProviderError { status: u16, message: String },

    #[error("Rate limited (429): {0}")]
    RateLimit(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}
