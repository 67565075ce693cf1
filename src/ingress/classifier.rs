use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::dedup::DedupStore;
use super::types::{Delivery, EventType, SenderKind};
use crate::config::LarkConfig;

// Lark replaces @-mentions in text content with these placeholders
static MENTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"@_(user_\d+|all)").unwrap());

/// A message that should be answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionableMessage {
    pub chat_id: String,
    pub sender_id: Option<String>,
    pub text: String,
    pub dedup_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Handshake(String),
    SelfEcho,
    AlreadyProcessed,
    EmptyMessage,
    Actionable(ActionableMessage),
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Handshake(_) => "handshake",
            Decision::SelfEcho => "self_echo",
            Decision::AlreadyProcessed => "duplicate",
            Decision::EmptyMessage => "empty",
            Decision::Actionable(_) => "accepted",
        }
    }
}

/// Signals that identify the bot's own messages. Either one is enough.
#[derive(Debug)]
pub struct SelfIdentity {
    automated_sender_types: Vec<String>,
    bot_open_id: RwLock<Option<String>>,
}

impl SelfIdentity {
    pub fn new(automated_sender_types: Vec<String>, bot_open_id: Option<String>) -> Self {
        Self {
            automated_sender_types,
            bot_open_id: RwLock::new(bot_open_id.filter(|id| !id.is_empty())),
        }
    }

    pub fn from_config(config: &LarkConfig) -> Self {
        Self::new(config.self_sender_types.clone(), config.bot_open_id.clone())
    }

    pub async fn set_bot_open_id(&self, open_id: String) {
        *self.bot_open_id.write().await = Some(open_id);
    }

    pub async fn bot_open_id(&self) -> Option<String> {
        self.bot_open_id.read().await.clone()
    }

    pub async fn is_self_authored(&self, delivery: &Delivery) -> bool {
        if delivery.sender_kind(&self.automated_sender_types) == SenderKind::Automated {
            return true;
        }
        match (self.bot_open_id.read().await.as_deref(), delivery.sender_id.as_deref()) {
            (Some(bot), Some(sender)) => bot == sender,
            _ => false,
        }
    }
}

/// Decides what to do with each delivery.
pub struct Classifier {
    dedup: Arc<DedupStore>,
    identity: Arc<SelfIdentity>,
}

impl Classifier {
    pub fn new(dedup: Arc<DedupStore>, identity: Arc<SelfIdentity>) -> Self {
        Self { dedup, identity }
    }

    pub fn identity(&self) -> &Arc<SelfIdentity> {
        &self.identity
    }

    pub fn dedup(&self) -> &Arc<DedupStore> {
        &self.dedup
    }

    pub async fn classify(&self, delivery: &Delivery) -> Decision {
        if delivery.event_type == EventType::Verification {
            return Decision::Handshake(delivery.challenge.clone().unwrap_or_default());
        }

        if self.identity.is_self_authored(delivery).await {
            debug!("Ignoring self-authored {}", delivery);
            return Decision::SelfEcho;
        }

        // Marked before any downstream work so a redelivery racing this one is suppressed
        let dedup_key = delivery.dedup_key();
        if let Some(ref key) = dedup_key {
            if !self.dedup.check_and_mark(key).await {
                debug!("Duplicate delivery {}", key);
                return Decision::AlreadyProcessed;
            }
        }

        if delivery.event_type != EventType::Message {
            return Decision::EmptyMessage;
        }

        let Some(message) = delivery.message.as_ref() else {
            return Decision::EmptyMessage;
        };

        let text = match message.content.as_deref().and_then(extract_text) {
            Some(t) => t,
            None => return Decision::EmptyMessage,
        };

        Decision::Actionable(ActionableMessage {
            chat_id: message.chat_id.clone(),
            sender_id: delivery.sender_id.clone(),
            text,
            dedup_key,
        })
    }
}

/// Pull plain text out of a message `content` string.
///
/// Handles `text` messages (`{"text": ...}`) and rich-text `post` messages,
/// with or without a locale wrapper. Returns `None` when nothing but
/// whitespace and mentions remain.
pub fn extract_text(content: &str) -> Option<String> {
    let value: Value = serde_json::from_str(content).ok()?;

    let raw = if let Some(text) = value.get("text").and_then(Value::as_str) {
        text.to_string()
    } else {
        post_text(&value)?
    };

    let cleaned = MENTION_RE.replace_all(&raw, "");
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn post_text(value: &Value) -> Option<String> {
    let post = if value.get("content").is_some() {
        value
    } else {
        // {"en_us": {"title": ..., "content": [...]}}
        value.as_object()?.values().find(|v| v.get("content").is_some())?
    };

    let mut parts: Vec<String> = Vec::new();
    if let Some(title) = post.get("title").and_then(Value::as_str) {
        if !title.trim().is_empty() {
            parts.push(title.to_string());
        }
    }
    for line in post.get("content")?.as_array()? {
        let Some(elements) = line.as_array() else {
            continue;
        };
        let line_text: String = elements
            .iter()
            .filter(|e| e.get("tag").and_then(Value::as_str) == Some("text"))
            .filter_map(|e| e.get("text").and_then(Value::as_str))
            .collect();
        if !line_text.is_empty() {
            parts.push(line_text);
        }
    }

    Some(parts.join("\n"))
}
