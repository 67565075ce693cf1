use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use crate::datasource::CredentialCache;

/// Lark rejects very large text bodies; long answers are split.
const MAX_MESSAGE_CHARS: usize = 4000;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Could not authenticate with the chat platform: {0}")]
    Auth(#[from] crate::datasource::AuthError),

    #[error("Message request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Chat platform rejected the message (code {code}): {message}")]
    Rejected { code: i64, message: String },
}

/// Outbound side of the chat platform.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_message(
        &self,
        target_type: &str,
        target_id: &str,
        text: &str,
    ) -> Result<(), TransportError>;
}

#[derive(Clone)]
pub struct LarkMessenger {
    client: Client,
    base_url: String,
    credentials: Arc<CredentialCache>,
}

impl LarkMessenger {
    pub fn new(base_url: &str, credentials: Arc<CredentialCache>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    /// The bot's own open_id, from the bot info API.
    pub async fn bot_open_id(&self) -> Result<String, TransportError> {
        let token = self.credentials.get_token().await?;
        let url = format!("{}/open-apis/bot/v3/info", self.base_url);

        let resp = self.client.get(&url).bearer_auth(token.value()).send().await?;
        let body: Value = resp.json().await?;

        let code = body["code"].as_i64().unwrap_or(-1);
        if code != 0 {
            return Err(TransportError::Rejected {
                code,
                message: body["msg"].as_str().unwrap_or_default().to_string(),
            });
        }

        body["bot"]["open_id"]
            .as_str()
            .filter(|id| !id.is_empty())
            .map(|id| id.to_string())
            .ok_or_else(|| TransportError::Rejected {
                code,
                message: "bot info has no open_id".to_string(),
            })
    }

    async fn send_chunk(
        &self,
        target_type: &str,
        target_id: &str,
        chunk: &str,
    ) -> Result<(), TransportError> {
        let token = self.credentials.get_token().await?;
        let url = format!("{}/open-apis/im/v1/messages", self.base_url);

        let body = json!({
            "receive_id": target_id,
            "msg_type": "text",
            "content": json!({ "text": chunk }).to_string(),
        });

        let resp = self
            .client
            .post(&url)
            .query(&[("receive_id_type", target_type)])
            .bearer_auth(token.value())
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let reply: Value = resp.json().await.unwrap_or(Value::Null);
        let code = reply["code"].as_i64().unwrap_or(if status.is_success() { 0 } else { -1 });

        if !status.is_success() || code != 0 {
            let message = reply["msg"]
                .as_str()
                .map(|m| m.to_string())
                .unwrap_or_else(|| status.to_string());
            error!("Lark send message error {}: {}", code, message);
            return Err(TransportError::Rejected { code, message });
        }

        Ok(())
    }
}

#[async_trait]
impl Messenger for LarkMessenger {
    async fn send_message(
        &self,
        target_type: &str,
        target_id: &str,
        text: &str,
    ) -> Result<(), TransportError> {
        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            self.send_chunk(target_type, target_id, &chunk).await?;
        }
        info!("Message sent to {} {}", target_type, target_id);
        Ok(())
    }
}

/// Split `text` into chunks of at most `max_chars` characters.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars
        .chunks(max_chars.max(1))
        .map(|c| c.iter().collect())
        .collect()
}
