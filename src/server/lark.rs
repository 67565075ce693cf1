use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::http::AppState;
use crate::ingress::{Decision, Delivery, ReplyJob};

const SIGNATURE_HEADER: &str = "x-lark-signature";
const TIMESTAMP_HEADER: &str = "x-lark-request-timestamp";
const NONCE_HEADER: &str = "x-lark-request-nonce";

const IV_LEN: usize = 16;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Error, Debug)]
pub enum DecryptError {
    #[error("Encrypted event is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Encrypted event has an invalid length ({0} bytes)")]
    Length(usize),

    #[error("Encrypted event could not be decrypted with the configured key")]
    Padding,
}

/// `POST /api/lark`
///
/// Everything up to the hand-off happens before the response is written;
/// the reply itself runs on the reply worker.
pub async fn webhook_handler(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let encrypt_key = state.config.lark.encrypt_key.as_deref().filter(|k| !k.is_empty());

    // 1. Verify signature
    if let Some(key) = encrypt_key {
        if !signature_matches(&headers, key, &body) {
            warn!("Rejected webhook call with a bad or missing signature");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    // 2. Parse delivery, decrypting the envelope when encryption is on
    let mut delivery = match Delivery::parse(&body) {
        Ok(d) => d,
        Err(e) => {
            warn!("{}", e);
            return acknowledge(Decision::EmptyMessage.label());
        }
    };

    if let Some(ciphertext) = delivery.encrypted.take() {
        let Some(key) = encrypt_key else {
            warn!("Received an encrypted event but lark.encrypt_key is not set");
            return acknowledge(Decision::EmptyMessage.label());
        };
        let plain = match decrypt_event(key, &ciphertext) {
            Ok(p) => p,
            Err(e) => {
                warn!("{}", e);
                return acknowledge(Decision::EmptyMessage.label());
            }
        };
        delivery = match Delivery::parse(&plain) {
            Ok(d) => d,
            Err(e) => {
                warn!("Decrypted event: {}", e);
                return acknowledge(Decision::EmptyMessage.label());
            }
        };
    }

    // 3. Verify token (inside the envelope for encrypted events)
    if let Some(expected) = state.config.lark.verification_token.as_deref().filter(|t| !t.is_empty()) {
        if delivery.token.as_deref() != Some(expected) {
            warn!("Rejected webhook call with a bad verification token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    // 4. Classify and hand off
    let decision = state.classifier.classify(&delivery).await;
    match decision {
        Decision::Handshake(challenge) => {
            info!("Answered URL verification handshake");
            Json(json!({ "challenge": challenge })).into_response()
        }
        Decision::Actionable(message) => {
            let dedup_key = message.dedup_key.clone();
            let chat_id = message.chat_id.clone();

            if let Err(e) = state.bus.push(ReplyJob { message }) {
                error!("Could not queue reply for chat {}: {}", chat_id, e);
                // Let the platform's redelivery through
                if let Some(key) = dedup_key {
                    state.dedup().forget(&key).await;
                }
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": e.to_string() })),
                )
                    .into_response();
            }

            debug!("Queued reply for chat {}", chat_id);
            acknowledge("accepted")
        }
        other => {
            debug!("Acknowledged {} without reply: {}", delivery, other.label());
            acknowledge(other.label())
        }
    }
}

fn acknowledge(status: &str) -> Response {
    Json(json!({ "ok": true, "status": status })).into_response()
}

/// `hex(sha256(timestamp + nonce + encrypt_key + body))`
pub fn compute_signature(timestamp: &str, nonce: &str, encrypt_key: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.update(encrypt_key.as_bytes());
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

/// Decrypt an `{"encrypt": ...}` envelope.
///
/// The payload is `base64(iv || AES-256-CBC(json))` with PKCS#7 padding,
/// keyed by `sha256(encrypt_key)`.
pub fn decrypt_event(encrypt_key: &str, encrypted: &str) -> Result<Vec<u8>, DecryptError> {
    let data = STANDARD.decode(encrypted.trim())?;
    if data.len() <= IV_LEN || (data.len() - IV_LEN) % IV_LEN != 0 {
        return Err(DecryptError::Length(data.len()));
    }

    let (iv, ciphertext) = data.split_at(IV_LEN);
    let key = Sha256::digest(encrypt_key.as_bytes());
    let decryptor =
        Aes256CbcDec::new_from_slices(key.as_slice(), iv).map_err(|_| DecryptError::Length(data.len()))?;

    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| DecryptError::Padding)
}

fn signature_matches(headers: &HeaderMap, encrypt_key: &str, body: &[u8]) -> bool {
    match (
        header(headers, SIGNATURE_HEADER),
        header(headers, TIMESTAMP_HEADER),
        header(headers, NONCE_HEADER),
    ) {
        (Some(signature), Some(timestamp), Some(nonce)) => {
            compute_signature(timestamp, nonce, encrypt_key, body).eq_ignore_ascii_case(signature)
        }
        _ => false,
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
