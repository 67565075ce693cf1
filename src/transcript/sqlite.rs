use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

use super::{TranscriptEntry, TranscriptError, TranscriptStore};

#[derive(Clone)]
pub struct SqliteTranscriptStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTranscriptStore {
    pub fn open(db_path: &Path) -> Result<Self, TranscriptError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS transcripts (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                question TEXT NOT NULL,
                answer TEXT NOT NULL,
                created_at TEXT NOT NULL,
                seq INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS transcripts_chat ON transcripts(chat_id, seq);
            "#,
        )?;

        debug!("Opened transcript store at {}", db_path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn insert(conn: &Connection, entry: &TranscriptEntry) -> Result<(), TranscriptError> {
        // seq orders entries saved within the same timestamp
        conn.execute(
            "INSERT INTO transcripts (id, chat_id, question, answer, created_at, seq)
             VALUES (?1, ?2, ?3, ?4, ?5,
                     (SELECT COALESCE(MAX(seq), 0) + 1 FROM transcripts))",
            params![
                entry.id,
                entry.chat_id,
                entry.question,
                entry.answer,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn select(conn: &Connection, chat_id: &str, limit: usize) -> Result<Vec<TranscriptEntry>, TranscriptError> {
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, question, answer, created_at FROM transcripts
             WHERE chat_id = ?1 ORDER BY seq DESC LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![chat_id, limit as i64], |row| {
            let created: String = row.get(4)?;
            let created_at = DateTime::parse_from_rfc3339(&created)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            Ok(TranscriptEntry {
                id: row.get(0)?,
                chat_id: row.get(1)?,
                question: row.get(2)?,
                answer: row.get(3)?,
                created_at,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, TranscriptError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, TranscriptError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| TranscriptError::Unavailable(format!("Lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| TranscriptError::Unavailable(e.to_string()))?
    }
}

#[async_trait]
impl TranscriptStore for SqliteTranscriptStore {
    async fn save(&self, chat_id: &str, question: &str, answer: &str) -> Result<TranscriptEntry, TranscriptError> {
        let entry = TranscriptEntry {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
            created_at: Utc::now(),
        };

        let stored = entry.clone();
        self.with_conn(move |conn| Self::insert(conn, &stored)).await?;
        Ok(entry)
    }

    async fn list(&self, chat_id: &str, limit: usize) -> Result<Vec<TranscriptEntry>, TranscriptError> {
        let chat_id = chat_id.to_string();
        self.with_conn(move |conn| Self::select(conn, &chat_id, limit)).await
    }
}
