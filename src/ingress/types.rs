use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Header `event_type` of a received chat message.
pub const MESSAGE_RECEIVE_EVENT: &str = "im.message.receive_v1";

const URL_VERIFICATION: &str = "url_verification";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// URL-ownership handshake sent when the webhook is registered
    Verification,
    Message,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderKind {
    Human,
    Automated,
}

#[derive(Error, Debug)]
#[error("Malformed webhook payload: {0}")]
pub struct MalformedPayloadError(pub String);

// Wire shape of a Lark event callback (schema 2.0, plus the bare handshake)
#[derive(Debug, Default, Deserialize)]
struct WebhookBody {
    #[serde(rename = "type")]
    kind: Option<String>,
    challenge: Option<String>,
    token: Option<String>,
    encrypt: Option<String>,
    header: Option<EventHeader>,
    event: Option<EventBody>,
}

#[derive(Debug, Default, Deserialize)]
struct EventHeader {
    event_id: Option<String>,
    event_type: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EventBody {
    message: Option<MessageBody>,
    sender: Option<SenderBody>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageBody {
    chat_id: Option<String>,
    message_id: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SenderBody {
    sender_type: Option<String>,
    sender_id: Option<SenderIds>,
}

#[derive(Debug, Default, Deserialize)]
struct SenderIds {
    open_id: Option<String>,
    user_id: Option<String>,
}

/// The message part of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub chat_id: String,
    pub message_id: Option<String>,
    /// JSON-encoded message body as sent by the platform
    pub content: Option<String>,
}

/// One inbound webhook call, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_id: Option<String>,
    pub event_type: EventType,
    pub sender_type: Option<String>,
    pub sender_id: Option<String>,
    pub message: Option<MessageRef>,
    pub challenge: Option<String>,
    pub token: Option<String>,
    /// Base64 ciphertext when the app has event encryption turned on
    pub encrypted: Option<String>,
}

impl Delivery {
    pub fn parse(body: &[u8]) -> Result<Self, MalformedPayloadError> {
        let raw: WebhookBody =
            serde_json::from_slice(body).map_err(|e| MalformedPayloadError(e.to_string()))?;
        Ok(Self::from_wire(raw))
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, MalformedPayloadError> {
        let raw: WebhookBody =
            serde_json::from_value(value).map_err(|e| MalformedPayloadError(e.to_string()))?;
        Ok(Self::from_wire(raw))
    }

    fn from_wire(raw: WebhookBody) -> Self {
        let header = raw.header.unwrap_or_default();
        let event = raw.event.unwrap_or_default();

        let event_type = if raw.kind.as_deref() == Some(URL_VERIFICATION) {
            EventType::Verification
        } else {
            match header.event_type.as_deref() {
                Some(MESSAGE_RECEIVE_EVENT) => EventType::Message,
                None if event.message.is_some() => EventType::Message,
                _ => EventType::Other,
            }
        };

        let sender = event.sender.unwrap_or_default();
        let sender_id = sender
            .sender_id
            .and_then(|ids| ids.open_id.or(ids.user_id));

        let message = event.message.and_then(|m| {
            let chat_id = m.chat_id.filter(|c| !c.is_empty())?;
            Some(MessageRef {
                chat_id,
                message_id: m.message_id.filter(|id| !id.is_empty()),
                content: m.content,
            })
        });

        Self {
            delivery_id: header.event_id.filter(|id| !id.is_empty()),
            event_type,
            sender_type: sender.sender_type,
            sender_id,
            message,
            challenge: raw.challenge,
            token: raw.token.or(header.token),
            encrypted: raw.encrypt.filter(|e| !e.is_empty()),
        }
    }

    pub fn sender_kind(&self, automated_types: &[String]) -> SenderKind {
        match self.sender_type.as_deref() {
            Some(t) if automated_types.iter().any(|a| a.eq_ignore_ascii_case(t)) => {
                SenderKind::Automated
            }
            _ => SenderKind::Human,
        }
    }

    /// Global event id if present, else `chat_id:message_id`.
    pub fn dedup_key(&self) -> Option<String> {
        if let Some(ref id) = self.delivery_id {
            return Some(id.clone());
        }
        let message = self.message.as_ref()?;
        let message_id = message.message_id.as_ref()?;
        Some(format!("{}:{}", message.chat_id, message_id))
    }
}

impl fmt::Display for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} delivery {} from {}",
            self.event_type,
            self.delivery_id.as_deref().unwrap_or("-"),
            self.sender_id.as_deref().unwrap_or("unknown"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_handshake() {
        let d = Delivery::parse(br#"{"type":"url_verification","challenge":"abc123","token":"v"}"#)
            .unwrap();
        assert_eq!(d.event_type, EventType::Verification);
        assert_eq!(d.challenge.as_deref(), Some("abc123"));
        assert_eq!(d.token.as_deref(), Some("v"));
    }

    #[test]
    fn test_parse_message_event() {
        let d = Delivery::from_value(json!({
            "schema": "2.0",
            "header": {"event_id": "ev-1", "event_type": "im.message.receive_v1", "token": "t"},
            "event": {
                "sender": {"sender_type": "user", "sender_id": {"open_id": "ou_1"}},
                "message": {
                    "chat_id": "oc_9",
                    "message_id": "om_5",
                    "chat_type": "group",
                    "message_type": "text",
                    "content": "{\"text\":\"hi\"}"
                }
            }
        }))
        .unwrap();
        assert_eq!(d.event_type, EventType::Message);
        assert_eq!(d.delivery_id.as_deref(), Some("ev-1"));
        assert_eq!(d.sender_id.as_deref(), Some("ou_1"));
        assert_eq!(d.token.as_deref(), Some("t"));
        assert_eq!(d.dedup_key().as_deref(), Some("ev-1"));
        assert_eq!(d.sender_kind(&["app".to_string()]), SenderKind::Human);
    }

    #[test]
    fn test_dedup_key_falls_back_to_chat_and_message() {
        let d = Delivery::from_value(json!({
            "event": {"message": {"chat_id": "oc_9", "message_id": "om_5", "content": "{}"}}
        }))
        .unwrap();
        assert_eq!(d.event_type, EventType::Message);
        assert_eq!(d.dedup_key().as_deref(), Some("oc_9:om_5"));
    }

    #[test]
    fn test_no_key_without_ids() {
        let d = Delivery::from_value(json!({"event": {"message": {"chat_id": "oc_9"}}})).unwrap();
        assert_eq!(d.dedup_key(), None);
    }

    #[test]
    fn test_sender_kind_uses_configured_types() {
        let d = Delivery::from_value(json!({"event": {"sender": {"sender_type": "App"}}})).unwrap();
        assert_eq!(d.sender_kind(&["app".to_string()]), SenderKind::Automated);
        assert_eq!(d.sender_kind(&[]), SenderKind::Human);
    }

    #[test]
    fn test_encrypted_envelope_keeps_ciphertext() {
        let d = Delivery::parse(br#"{"encrypt":"c2VjcmV0"}"#).unwrap();
        assert_eq!(d.encrypted.as_deref(), Some("c2VjcmV0"));
        assert_eq!(d.event_type, EventType::Other);
        assert_eq!(d.dedup_key(), None);
    }

    #[test]
    fn test_unparseable_body_is_malformed() {
        assert!(Delivery::parse(b"not json").is_err());
        assert!(Delivery::parse(b"[1,2,3]").is_err());
    }
}
