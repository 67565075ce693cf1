//! HTTP server for the Lark relay
//!
//! One webhook route plus liveness and status endpoints. Reply work is
//! handed to the reply worker so the webhook can acknowledge immediately.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::lark::webhook_handler;
use crate::agent::GeminiClient;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::datasource::{BitableClient, CredentialCache, DataFetcher, TenantTokenSource};
use crate::ingress::{reply_loop, Classifier, DedupStore, LarkMessenger, ReplyBus, ReplyPipeline, SelfIdentity};
use crate::transcript::SqliteTranscriptStore;

/// Shared state of the webhook routes.
pub struct AppState {
    pub config: Config,
    pub classifier: Arc<Classifier>,
    pub bus: ReplyBus,
}

impl AppState {
    pub fn new(config: Config, classifier: Arc<Classifier>, bus: ReplyBus) -> Self {
        Self {
            config,
            classifier,
            bus,
        }
    }

    pub fn dedup(&self) -> &Arc<DedupStore> {
        self.classifier.dedup()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/api/status", get(status))
        .route("/api/lark", post(webhook_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate_for_serving()?;
        Ok(Self {
            config: config.clone(),
        })
    }

    pub async fn run(&self) -> Result<()> {
        let config = &self.config;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let timeout = config.fetch.request_timeout();
        let margin = Duration::from_secs(config.lark.token_safety_margin_seconds);

        let chat_credentials = Arc::new(CredentialCache::new(
            Arc::new(TenantTokenSource::new(
                &config.lark.base_url,
                config.lark.app_id.clone(),
                config.lark.app_secret.clone(),
                timeout,
            )),
            clock.clone(),
            margin,
        ));

        // The data source may belong to a different Lark app
        let (data_app_id, data_app_secret) = config.bitable.credentials(&config.lark);
        let data_credentials = if data_app_id == config.lark.app_id && data_app_secret == config.lark.app_secret {
            chat_credentials.clone()
        } else {
            Arc::new(CredentialCache::new(
                Arc::new(TenantTokenSource::new(
                    &config.lark.base_url,
                    data_app_id.to_string(),
                    data_app_secret.to_string(),
                    timeout,
                )),
                clock.clone(),
                margin,
            ))
        };

        let records = Arc::new(BitableClient::new(
            &config.lark.base_url,
            config.bitable.app_token.clone(),
            config.bitable.table_id.clone(),
            config.bitable.view_id.clone(),
            timeout,
        ));
        let fetcher = Arc::new(DataFetcher::from_config(data_credentials, records, config));
        let messenger = Arc::new(LarkMessenger::new(&config.lark.base_url, chat_credentials, timeout));
        let completion = Arc::new(GeminiClient::from_config(&config.gemini)?);

        let mut pipeline = ReplyPipeline::new(fetcher, completion, messenger.clone(), config.pipeline.clone())
            .with_receive_id_type(config.lark.receive_id_type.clone());
        if config.transcript.enabled {
            let path = config.transcript_path();
            let store = SqliteTranscriptStore::open(&path)
                .with_context(|| format!("Failed to open transcript store at {}", path.display()))?;
            info!("Saving transcripts to {}", path.display());
            pipeline = pipeline.with_transcripts(Arc::new(store));
        }

        let dedup = Arc::new(DedupStore::new(config.dedup.capacity, config.dedup.ttl(), clock));
        let _sweeper = dedup.spawn_sweeper(Duration::from_secs(config.dedup.sweep_interval_seconds));

        let identity = Arc::new(SelfIdentity::from_config(&config.lark));
        if identity.bot_open_id().await.is_none() && config.lark.resolve_bot_identity {
            match messenger.bot_open_id().await {
                Ok(open_id) => {
                    info!("Resolved bot open_id {}", open_id);
                    identity.set_bot_open_id(open_id).await;
                }
                Err(e) => warn!(
                    "Could not resolve bot identity, relying on sender type only: {}",
                    e
                ),
            }
        }

        let bus = ReplyBus::new(config.server.reply_queue_capacity);
        tokio::spawn(reply_loop(
            bus.receiver(),
            Arc::new(pipeline),
            config.server.max_concurrent_replies,
            None,
        ));

        let classifier = Arc::new(Classifier::new(dedup, identity));
        let state = Arc::new(AppState::new(config.clone(), classifier, bus));
        let app = router(state);

        let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
            .parse()
            .context("Invalid bind address")?;

        info!("Starting HTTP server on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn root() -> &'static str {
    "Lark Base relay is running"
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    model: String,
    dedup_entries: usize,
    dedup_capacity: usize,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: state.config.gemini.model.clone(),
        dedup_entries: state.dedup().len().await,
        dedup_capacity: state.dedup().capacity(),
    })
}
