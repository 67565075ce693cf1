use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::lark_client::Messenger;
use crate::agent::{apply_filters, parse_filter_reply, CompletionService, LlmError, PromptBuilder};
use crate::config::{PipelineConfig, PipelineMode};
use crate::datasource::{DataFetcher, FetchError, TableSnapshot};
use crate::transcript::{TranscriptEntry, TranscriptStore};

/// How a single reply run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Replied {
        chat_id: String,
        answer: String,
        delivered: bool,
    },
    NoData {
        chat_id: String,
    },
    Failed {
        chat_id: String,
        error: String,
    },
}

impl PipelineOutcome {
    pub fn chat_id(&self) -> &str {
        match self {
            PipelineOutcome::Replied { chat_id, .. }
            | PipelineOutcome::NoData { chat_id }
            | PipelineOutcome::Failed { chat_id, .. } => chat_id,
        }
    }
}

#[derive(Error, Debug)]
enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Completion failed: {0}")]
    Completion(#[from] LlmError),
}

/// Answers one question: snapshot, prompt, completion, reply.
pub struct ReplyPipeline {
    fetcher: Arc<DataFetcher>,
    completion: Arc<dyn CompletionService>,
    messenger: Arc<dyn Messenger>,
    transcripts: Option<Arc<dyn TranscriptStore>>,
    prompts: PromptBuilder,
    config: PipelineConfig,
    receive_id_type: String,
}

impl ReplyPipeline {
    pub fn new(
        fetcher: Arc<DataFetcher>,
        completion: Arc<dyn CompletionService>,
        messenger: Arc<dyn Messenger>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            fetcher,
            completion,
            messenger,
            transcripts: None,
            prompts: PromptBuilder::from_config(&config),
            config,
            receive_id_type: "chat_id".to_string(),
        }
    }

    pub fn with_transcripts(mut self, store: Arc<dyn TranscriptStore>) -> Self {
        self.transcripts = Some(store);
        self
    }

    pub fn with_receive_id_type(mut self, receive_id_type: impl Into<String>) -> Self {
        self.receive_id_type = receive_id_type.into();
        self
    }

    /// Run the pipeline to completion. Never fails: every error ends in a
    /// logged `Failed` outcome and a best-effort apology.
    pub async fn run(&self, chat_id: &str, sender_id: Option<&str>, text: &str) -> PipelineOutcome {
        info!(
            "Answering chat {} (sender {}): {}",
            chat_id,
            sender_id.unwrap_or("unknown"),
            text
        );

        match self.answer(chat_id, text).await {
            Ok(Some(answer)) => {
                let delivered = self.deliver(chat_id, &answer).await;
                self.persist(chat_id, text, &answer).await;
                PipelineOutcome::Replied {
                    chat_id: chat_id.to_string(),
                    answer,
                    delivered,
                }
            }
            Ok(None) => {
                info!("No table data available for chat {}", chat_id);
                self.deliver(chat_id, &self.config.no_data_notice).await;
                PipelineOutcome::NoData {
                    chat_id: chat_id.to_string(),
                }
            }
            Err(e) => {
                error!("Reply pipeline failed for chat {}: {}", chat_id, e);
                self.deliver(chat_id, &self.config.apology).await;
                PipelineOutcome::Failed {
                    chat_id: chat_id.to_string(),
                    error: e.to_string(),
                }
            }
        }
    }

    /// `Ok(None)` when there is no data to answer from.
    async fn answer(&self, chat_id: &str, question: &str) -> Result<Option<String>, PipelineError> {
        let snapshot = self.fetcher.fetch_table(None).await?;
        if snapshot.is_empty() {
            return Ok(None);
        }

        let snapshot = match self.config.mode {
            PipelineMode::Direct => snapshot,
            PipelineMode::Filter => {
                let filtered = self.narrow(snapshot, question).await;
                if filtered.is_empty() {
                    debug!("Filter matched no records");
                    return Ok(Some(self.config.not_found_reply.clone()));
                }
                filtered
            }
        };

        let history = self.history(chat_id).await;
        let prompt = self.prompts.answer_prompt(&snapshot, question, &history);
        let completion = self.completion.complete(&prompt).await?;

        Ok(Some(completion.answer_text().unwrap_or_else(|| {
            warn!("Completion response had no answer text");
            self.config.fallback_answer.clone()
        })))
    }

    /// Ask the model for filter conditions and apply them. Any problem with
    /// the filter step leaves the snapshot untouched.
    async fn narrow(&self, snapshot: TableSnapshot, question: &str) -> TableSnapshot {
        let prompt = self.prompts.filter_prompt(&snapshot, question);
        let reply = match self.completion.complete(&prompt).await {
            Ok(c) => c.answer_text().unwrap_or_default(),
            Err(e) => {
                warn!("Filter request failed, using all records: {}", e);
                return snapshot;
            }
        };

        match parse_filter_reply(&reply) {
            Ok(conditions) => {
                let filtered = apply_filters(&snapshot, &conditions);
                debug!(
                    "Applied {} filter conditions: {} of {} records kept",
                    conditions.len(),
                    filtered.len(),
                    snapshot.len()
                );
                filtered
            }
            Err(e) => {
                warn!("{}; using all records", e);
                snapshot
            }
        }
    }

    async fn history(&self, chat_id: &str) -> Vec<TranscriptEntry> {
        let Some(store) = self.transcripts.as_ref() else {
            return Vec::new();
        };
        if self.config.history_turns == 0 {
            return Vec::new();
        }
        match store.list(chat_id, self.config.history_turns).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Could not load history for chat {}: {}", chat_id, e);
                Vec::new()
            }
        }
    }

    async fn deliver(&self, chat_id: &str, text: &str) -> bool {
        match self
            .messenger
            .send_message(&self.receive_id_type, chat_id, text)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to send reply to chat {}: {}", chat_id, e);
                false
            }
        }
    }

    async fn persist(&self, chat_id: &str, question: &str, answer: &str) {
        if let Some(store) = self.transcripts.as_ref() {
            if let Err(e) = store.save(chat_id, question, answer).await {
                warn!("Failed to save transcript for chat {}: {}", chat_id, e);
            }
        }
    }
}
