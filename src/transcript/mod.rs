pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub use sqlite::SqliteTranscriptStore;

/// One answered question.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub id: String,
    pub chat_id: String,
    pub question: String,
    pub answer: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum TranscriptError {
    #[error("Transcript database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Transcript store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transcript store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn save(&self, chat_id: &str, question: &str, answer: &str) -> Result<TranscriptEntry, TranscriptError>;

    /// Entries for `chat_id`, newest first.
    async fn list(&self, chat_id: &str, limit: usize) -> Result<Vec<TranscriptEntry>, TranscriptError>;
}
