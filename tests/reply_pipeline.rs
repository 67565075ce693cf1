mod common;

use async_trait::async_trait;
use std::sync::Arc;
use tempfile::TempDir;

use common::{fetcher_over, sales_rows, unavailable, RecordingMessenger, ScriptedCompletion, ScriptedRecordSource};
use lark_base_relay::config::{FetchPolicy, PipelineConfig};
use lark_base_relay::ingress::{PipelineOutcome, ReplyPipeline};
use lark_base_relay::transcript::{SqliteTranscriptStore, TranscriptEntry, TranscriptError, TranscriptStore};

#[tokio::test]
async fn test_empty_table_sends_one_notice_and_skips_completion() {
    let completion = ScriptedCompletion::new("unused");
    let messenger = RecordingMessenger::new();
    let config = PipelineConfig::default();
    let notice = config.no_data_notice.clone();

    let pipeline = ReplyPipeline::new(
        fetcher_over(Arc::new(ScriptedRecordSource::new(Vec::new()))),
        completion.clone(),
        messenger.clone(),
        config,
    );

    let outcome = pipeline.run("oc_1", Some("ou_1"), "how many rows?").await;

    assert_eq!(outcome, PipelineOutcome::NoData { chat_id: "oc_1".to_string() });
    assert_eq!(completion.calls(), 0);
    assert_eq!(messenger.sent(), vec![("oc_1".to_string(), notice)]);
}

#[tokio::test]
async fn test_unavailable_table_degrades_to_notice() {
    let source = ScriptedRecordSource::new(sales_rows())
        .then(unavailable())
        .then(unavailable())
        .then(unavailable());
    let completion = ScriptedCompletion::new("unused");
    let messenger = RecordingMessenger::new();

    let pipeline = ReplyPipeline::new(
        fetcher_over(Arc::new(source)),
        completion.clone(),
        messenger.clone(),
        PipelineConfig::default(),
    );

    assert!(matches!(
        pipeline.run("oc_1", None, "q").await,
        PipelineOutcome::NoData { .. }
    ));
    assert_eq!(completion.calls(), 0);
    assert_eq!(messenger.sent().len(), 1);
}

#[tokio::test]
async fn test_strict_exhaustion_sends_apology() {
    let source = ScriptedRecordSource::new(sales_rows())
        .then(unavailable())
        .then(unavailable())
        .then(unavailable());
    let fetcher = Arc::new(common::fetcher_for(Arc::new(source)).with_policy(FetchPolicy::Strict));
    let messenger = RecordingMessenger::new();
    let config = PipelineConfig::default();
    let apology = config.apology.clone();

    let pipeline = ReplyPipeline::new(fetcher, ScriptedCompletion::new("unused"), messenger.clone(), config);

    match pipeline.run("oc_1", None, "q").await {
        PipelineOutcome::Failed { error, .. } => assert!(error.contains("3 attempts")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(messenger.sent(), vec![("oc_1".to_string(), apology)]);
}

#[tokio::test]
async fn test_answers_are_saved_and_fed_back_as_history() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteTranscriptStore::open(&dir.path().join("transcripts.db")).unwrap());
    let completion = ScriptedCompletion::new("Alice sold 120");
    let messenger = RecordingMessenger::new();

    let config = PipelineConfig {
        history_turns: 2,
        ..PipelineConfig::default()
    };
    let pipeline = ReplyPipeline::new(
        fetcher_over(Arc::new(ScriptedRecordSource::new(sales_rows()))),
        completion.clone(),
        messenger.clone(),
        config,
    )
    .with_transcripts(store.clone());

    pipeline.run("oc_1", None, "who sold most?").await;
    pipeline.run("oc_1", None, "and in the south?").await;

    let saved = store.list("oc_1", 10).await.unwrap();
    assert_eq!(saved.len(), 2);
    assert_eq!(saved[0].question, "and in the south?");
    assert_eq!(saved[1].answer, "Alice sold 120");

    let prompts = completion.prompts();
    assert!(!prompts[0].contains("Earlier in this conversation"));
    assert!(prompts[1].contains("User: who sold most?"));
    assert!(prompts[1].contains("Assistant: Alice sold 120"));
    assert_eq!(messenger.sent().len(), 2);
}

/// A store whose database is gone.
struct BrokenStore;

#[async_trait]
impl TranscriptStore for BrokenStore {
    async fn save(&self, _chat_id: &str, _question: &str, _answer: &str) -> Result<TranscriptEntry, TranscriptError> {
        Err(TranscriptError::Unavailable("disk detached".to_string()))
    }

    async fn list(&self, _chat_id: &str, _limit: usize) -> Result<Vec<TranscriptEntry>, TranscriptError> {
        Err(TranscriptError::Unavailable("disk detached".to_string()))
    }
}

#[tokio::test]
async fn test_transcript_failures_do_not_block_the_reply() {
    let completion = ScriptedCompletion::new("Alice");
    let messenger = RecordingMessenger::new();
    let config = PipelineConfig {
        history_turns: 3,
        ..PipelineConfig::default()
    };
    let pipeline = ReplyPipeline::new(
        fetcher_over(Arc::new(ScriptedRecordSource::new(sales_rows()))),
        completion.clone(),
        messenger.clone(),
        config,
    )
    .with_transcripts(Arc::new(BrokenStore));

    let outcome = pipeline.run("oc_1", Some("ou_1"), "who sold most?").await;

    assert_eq!(
        outcome,
        PipelineOutcome::Replied {
            chat_id: "oc_1".to_string(),
            answer: "Alice".to_string(),
            delivered: true,
        }
    );
    assert_eq!(messenger.sent(), vec![("oc_1".to_string(), "Alice".to_string())]);
    assert_eq!(completion.calls(), 1);
    assert!(!completion.prompts()[0].contains("Earlier in this conversation"));
}
