// Shared fakes for the integration tests. Not every test file uses every helper.
#![allow(dead_code)]

use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::sync::mpsc;

use lark_base_relay::agent::{Completion, CompletionService, LlmError};
use lark_base_relay::clock::{Clock, ManualClock};
use lark_base_relay::config::Config;
use lark_base_relay::datasource::{
    AuthError, CredentialCache, DataFetcher, DataSourceError, PageRequest, Record, RecordPage, RecordSource,
    RetryPolicy, TokenGrant, TokenSource,
};
use lark_base_relay::ingress::{
    reply_loop, Classifier, DedupStore, Messenger, PipelineOutcome, ReplyBus, ReplyPipeline, SelfIdentity,
    TransportError,
};
use lark_base_relay::server::{router, AppState};

pub fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap_or_default()
}

pub fn sales_rows() -> Vec<Record> {
    vec![
        record(json!({"Name": "Alice", "Region": "North", "Sales": 120})),
        record(json!({"Name": "Bob", "Region": "South", "Sales": 80})),
    ]
}

/// Hands out `t-1`, `t-2`, ... and counts exchanges.
pub struct CountingTokenSource {
    pub calls: AtomicUsize,
    pub lifetime: Duration,
}

impl CountingTokenSource {
    pub fn new(lifetime: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            lifetime,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for CountingTokenSource {
    async fn exchange(&self) -> Result<TokenGrant, AuthError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenGrant {
            token: format!("t-{}", n),
            lifetime: self.lifetime,
        })
    }
}

pub struct FailingTokenSource;

#[async_trait]
impl TokenSource for FailingTokenSource {
    async fn exchange(&self) -> Result<TokenGrant, AuthError> {
        Err(AuthError::Rejected {
            code: 10003,
            message: "invalid app_id".to_string(),
        })
    }
}

/// Plays back scripted results, then serves `rows` forever.
pub struct ScriptedRecordSource {
    script: Mutex<VecDeque<Result<RecordPage, DataSourceError>>>,
    rows: Vec<Record>,
    calls: AtomicUsize,
    tokens: Mutex<Vec<String>>,
    delay: Duration,
}

impl ScriptedRecordSource {
    pub fn new(rows: Vec<Record>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            rows,
            calls: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn then(self, result: Result<RecordPage, DataSourceError>) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordSource for ScriptedRecordSource {
    async fn list_records(&self, token: &str, _page: &PageRequest) -> Result<RecordPage, DataSourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(token.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => Ok(RecordPage {
                records: self.rows.clone(),
                has_more: false,
                page_token: None,
            }),
        }
    }
}

pub fn unavailable() -> Result<RecordPage, DataSourceError> {
    Err(DataSourceError::Http {
        status: 503,
        message: "service unavailable".to_string(),
    })
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff: Duration::from_millis(5),
        request_timeout: Duration::from_secs(2),
    }
}

pub fn fetcher_for(source: Arc<ScriptedRecordSource>) -> DataFetcher {
    let credentials = Arc::new(CredentialCache::new(
        CountingTokenSource::new(Duration::from_secs(7200)),
        Arc::new(ManualClock::new()),
        Duration::from_secs(60),
    ));
    DataFetcher::new(credentials, source).with_retry(fast_retry())
}

pub fn fetcher_over(source: Arc<ScriptedRecordSource>) -> Arc<DataFetcher> {
    Arc::new(fetcher_for(source))
}

/// Records every outbound message.
#[derive(Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<(String, String, String)>>,
}

impl RecordingMessenger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(target_id, text)` pairs in send order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, id, text)| (id.clone(), text.clone()))
            .collect()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send_message(&self, target_type: &str, target_id: &str, text: &str) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((target_type.to_string(), target_id.to_string(), text.to_string()));
        Ok(())
    }
}

/// Answers every prompt with a fixed text after an optional delay.
pub struct ScriptedCompletion {
    answer: String,
    delay: Duration,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedCompletion {
    pub fn new(answer: &str) -> Arc<Self> {
        Self::slow(answer, Duration::ZERO)
    }

    pub fn slow(answer: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            answer: answer.to_string(),
            delay,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, prompt: &str) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Completion::from_text(&self.answer))
    }
}

/// A Lark `im.message.receive_v1` callback body.
pub fn message_event(event_id: &str, chat_id: &str, text: &str, sender_type: &str, open_id: &str) -> Value {
    json!({
        "schema": "2.0",
        "header": {
            "event_id": event_id,
            "event_type": "im.message.receive_v1",
            "token": "verify-me",
            "app_id": "cli_test"
        },
        "event": {
            "sender": {
                "sender_id": { "open_id": open_id },
                "sender_type": sender_type
            },
            "message": {
                "message_id": format!("om_{}", event_id),
                "chat_id": chat_id,
                "chat_type": "group",
                "message_type": "text",
                "content": json!({ "text": text }).to_string()
            }
        }
    })
}

/// Wrap `body` the way Lark does when event encryption is on.
pub fn encrypted_envelope(encrypt_key: &str, body: &Value) -> Value {
    let iv = *b"0123456789abcdef";
    let key = Sha256::digest(encrypt_key.as_bytes());
    let ciphertext = cbc::Encryptor::<aes::Aes256>::new_from_slices(key.as_slice(), &iv)
        .unwrap()
        .encrypt_padded_vec_mut::<Pkcs7>(body.to_string().as_bytes());
    json!({ "encrypt": STANDARD.encode([iv.as_slice(), ciphertext.as_slice()].concat()) })
}

pub struct TestApp {
    pub addr: SocketAddr,
    pub dedup: Arc<DedupStore>,
    pub clock: Arc<ManualClock>,
    pub outcomes: mpsc::UnboundedReceiver<PipelineOutcome>,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn next_outcome(&mut self) -> PipelineOutcome {
        tokio::time::timeout(Duration::from_secs(5), self.outcomes.recv())
            .await
            .expect("pipeline did not finish in time")
            .expect("outcome channel closed")
    }
}

pub struct AppParts {
    pub config: Config,
    pub records: Arc<ScriptedRecordSource>,
    pub completion: Arc<dyn CompletionService>,
    pub messenger: Arc<dyn Messenger>,
    pub bot_open_id: Option<String>,
    /// When false the reply worker is not started, so queued jobs stay queued.
    pub start_worker: bool,
}

impl AppParts {
    pub fn new(completion: Arc<dyn CompletionService>, messenger: Arc<dyn Messenger>) -> Self {
        Self {
            config: Config::default(),
            records: Arc::new(ScriptedRecordSource::new(sales_rows())),
            completion,
            messenger,
            bot_open_id: None,
            start_worker: true,
        }
    }
}

/// Serve the webhook on an ephemeral port with fakes behind it.
pub async fn spawn_app(parts: AppParts) -> TestApp {
    let clock = Arc::new(ManualClock::new());
    let shared_clock: Arc<dyn Clock> = clock.clone();
    let config = parts.config;

    let pipeline = Arc::new(ReplyPipeline::new(
        fetcher_over(parts.records),
        parts.completion,
        parts.messenger,
        config.pipeline.clone(),
    ));

    let dedup = Arc::new(DedupStore::new(config.dedup.capacity, config.dedup.ttl(), shared_clock));
    let identity = Arc::new(SelfIdentity::new(config.lark.self_sender_types.clone(), parts.bot_open_id));
    let bus = ReplyBus::new(config.server.reply_queue_capacity);

    let (tx, outcomes) = mpsc::unbounded_channel();
    if parts.start_worker {
        tokio::spawn(reply_loop(
            bus.receiver(),
            pipeline,
            config.server.max_concurrent_replies,
            Some(tx),
        ));
    }

    let classifier = Arc::new(Classifier::new(dedup.clone(), identity));
    let state = Arc::new(AppState::new(config, classifier, bus));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });

    TestApp {
        addr,
        dedup,
        clock,
        outcomes,
    }
}
