use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::llm_error::LlmError;
use crate::config::GeminiConfig;

/// Raw completion response. The answer is extracted lazily so an
/// unexpected shape can fall back to a placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    raw: Value,
}

impl Completion {
    pub fn from_raw(raw: Value) -> Self {
        Self { raw }
    }

    /// A response shaped like a `generateContent` reply carrying `text`.
    pub fn from_text(text: &str) -> Self {
        Self::from_raw(json!({
            "candidates": [{ "content": { "parts": [{ "text": text }] } }]
        }))
    }

    /// `candidates[0].content.parts[0].text`, when present and not blank.
    pub fn answer_text(&self) -> Option<String> {
        self.raw["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<Completion, LlmError>;
}

pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: String, base_url: &str, model: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    pub fn from_config(config: &GeminiConfig) -> Result<Self, LlmError> {
        if config.api_key.is_empty() {
            return Err(LlmError::ConfigError("Gemini API key is missing".to_string()));
        }
        Ok(Self::new(
            config.api_key.clone(),
            &config.base_url,
            &config.model,
            Duration::from_secs(config.timeout_seconds),
        ))
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl CompletionService for GeminiClient {
    async fn complete(&self, prompt: &str) -> Result<Completion, LlmError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
        });

        debug!("Calling {} with a {} char prompt", self.model, prompt.len());

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::RateLimit(text));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::ProviderError {
                status: status.as_u16(),
                message: text,
            });
        }

        let raw: Value = response.json().await?;
        Ok(Completion::from_raw(raw))
    }
}
