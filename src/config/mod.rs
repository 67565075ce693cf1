
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

static TABLE_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^tbl[A-Za-z0-9]+$").unwrap());

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub lark: LarkConfig,

    #[serde(default)]
    pub bitable: BitableConfig,

    #[serde(default)]
    pub gemini: GeminiConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub transcript: TranscriptConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Pending reply jobs accepted before the webhook starts answering 500
    #[serde(default = "default_reply_queue_capacity")]
    pub reply_queue_capacity: usize,

    /// Replies running at once; further jobs wait in the queue
    #[serde(default = "default_max_concurrent_replies")]
    pub max_concurrent_replies: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LarkConfig {
    #[serde(default = "default_lark_base_url")]
    pub base_url: String,

    /// App credentials used for sending chat messages
    #[serde(default)]
    pub app_id: String,

    #[serde(default)]
    pub app_secret: String,

    /// Event subscription verification token. Unset disables the check.
    #[serde(default)]
    pub verification_token: Option<String>,

    /// Event subscription encrypt key, used for `X-Lark-Signature` checks.
    #[serde(default)]
    pub encrypt_key: Option<String>,

    /// The bot's own open_id. Messages from this sender are never answered.
    #[serde(default)]
    pub bot_open_id: Option<String>,

    /// Look up `bot_open_id` from the bot info API at startup when unset
    #[serde(default = "default_true")]
    pub resolve_bot_identity: bool,

    /// `sender_type` values that mark a message as automated
    #[serde(default = "default_self_sender_types")]
    pub self_sender_types: Vec<String>,

    #[serde(default = "default_receive_id_type")]
    pub receive_id_type: String,

    /// Seconds before expiry at which a cached tenant token is refreshed
    #[serde(default = "default_token_safety_margin")]
    pub token_safety_margin_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitableConfig {
    /// Credentials for the data source. Fall back to `lark.app_id`/`lark.app_secret`.
    #[serde(default)]
    pub app_id: Option<String>,

    #[serde(default)]
    pub app_secret: Option<String>,

    #[serde(default)]
    pub app_token: String,

    #[serde(default)]
    pub table_id: String,

    #[serde(default)]
    pub view_id: Option<String>,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Upper bound on pages walked for a single snapshot
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_gemini_model")]
    pub model: String,

    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,

    #[serde(default = "default_gemini_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,

    #[serde(default = "default_dedup_ttl")]
    pub ttl_seconds: u64,

    /// How often the background sweeper purges expired entries
    #[serde(default = "default_dedup_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FetchPolicy {
    /// Exhausted retries yield an empty snapshot
    #[default]
    Degrade,
    /// Exhausted retries surface a `DataSourceError`
    Strict,
}

impl std::str::FromStr for FetchPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "degrade" => Ok(FetchPolicy::Degrade),
            "strict" => Ok(FetchPolicy::Strict),
            other => anyhow::bail!("Unknown fetch policy '{}'. Expected degrade or strict", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff; attempt N waits N * backoff_ms before retrying
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    #[serde(default)]
    pub policy: FetchPolicy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    /// Send the snapshot straight into the answer prompt
    #[default]
    Direct,
    /// Ask the model for declarative filters first, then answer from the filtered rows
    Filter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub mode: PipelineMode,

    /// Records embedded in the prompt
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// Prior transcript entries for the same chat included in the prompt (0 = none)
    #[serde(default)]
    pub history_turns: usize,

    #[serde(default = "default_no_data_notice")]
    pub no_data_notice: String,

    #[serde(default = "default_fallback_answer")]
    pub fallback_answer: String,

    #[serde(default = "default_apology")]
    pub apology: String,

    #[serde(default = "default_not_found_reply")]
    pub not_found_reply: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_transcript_path")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_reply_queue_capacity() -> usize {
    256
}
fn default_max_concurrent_replies() -> usize {
    8
}
fn default_lark_base_url() -> String {
    "https://open.larksuite.com".to_string()
}
fn default_true() -> bool {
    true
}
fn default_self_sender_types() -> Vec<String> {
    vec!["app".to_string()]
}
fn default_receive_id_type() -> String {
    "chat_id".to_string()
}
fn default_token_safety_margin() -> u64 {
    60
}
fn default_page_size() -> u32 {
    500
}
fn default_max_pages() -> u32 {
    10
}
fn default_gemini_model() -> String {
    "gemini-1.5-flash".to_string()
}
fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_gemini_timeout() -> u64 {
    60
}
fn default_dedup_capacity() -> usize {
    1000
}
fn default_dedup_ttl() -> u64 {
    300 // 5 minutes
}
fn default_dedup_sweep_interval() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_request_timeout() -> u64 {
    10
}
fn default_max_records() -> usize {
    30
}
fn default_no_data_notice() -> String {
    "There is no data in the Lark Base table yet.".to_string()
}
fn default_fallback_answer() -> String {
    "The model returned no answer.".to_string()
}
fn default_apology() -> String {
    "Sorry, something went wrong while answering. Please try again in a moment.".to_string()
}
fn default_not_found_reply() -> String {
    "The data was not found in the table.".to_string()
}
fn default_transcript_path() -> String {
    "~/.lark-base-relay/transcripts.db".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            reply_queue_capacity: default_reply_queue_capacity(),
            max_concurrent_replies: default_max_concurrent_replies(),
        }
    }
}

impl Default for LarkConfig {
    fn default() -> Self {
        Self {
            base_url: default_lark_base_url(),
            app_id: String::new(),
            app_secret: String::new(),
            verification_token: None,
            encrypt_key: None,
            bot_open_id: None,
            resolve_bot_identity: default_true(),
            self_sender_types: default_self_sender_types(),
            receive_id_type: default_receive_id_type(),
            token_safety_margin_seconds: default_token_safety_margin(),
        }
    }
}

impl Default for BitableConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            app_secret: None,
            app_token: String::new(),
            table_id: String::new(),
            view_id: None,
            page_size: default_page_size(),
            max_pages: default_max_pages(),
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_gemini_model(),
            base_url: default_gemini_base_url(),
            timeout_seconds: default_gemini_timeout(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: default_dedup_capacity(),
            ttl_seconds: default_dedup_ttl(),
            sweep_interval_seconds: default_dedup_sweep_interval(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            request_timeout_seconds: default_request_timeout(),
            policy: FetchPolicy::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: PipelineMode::default(),
            max_records: default_max_records(),
            history_turns: 0,
            no_data_notice: default_no_data_notice(),
            fallback_answer: default_fallback_answer(),
            apology: default_apology(),
            not_found_reply: default_not_found_reply(),
        }
    }
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_transcript_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl FetchConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl BitableConfig {
    /// Data source credentials, falling back to the chat app's.
    pub fn credentials<'a>(&'a self, lark: &'a LarkConfig) -> (&'a str, &'a str) {
        let app_id = self.app_id.as_deref().unwrap_or(&lark.app_id);
        let app_secret = self.app_secret.as_deref().unwrap_or(&lark.app_secret);
        (app_id, app_secret)
    }
}

impl Config {
    /// Load configuration from `path` (or the default location), then apply
    /// `${VAR}` expansion and environment overrides.
    ///
    /// A missing file at the default location is not an error: everything can
    /// come from the environment. A missing explicit `path` is.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // A .env next to the binary is the usual deployment shape
        let _ = dotenvy::dotenv();

        let path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file {} does not exist", p.display());
                }
                p.to_path_buf()
            }
            None => Self::config_path()?,
        };

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        } else {
            Config::default()
        };

        config.expand_env_vars();
        config.apply_overrides(|key| std::env::var(key).ok())?;

        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }

    pub fn config_path() -> Result<PathBuf> {
        if let Ok(p) = std::env::var("LARK_RELAY_CONFIG") {
            if !p.trim().is_empty() {
                return Ok(PathBuf::from(shellexpand::tilde(p.trim()).to_string()));
            }
        }

        let base = directories::BaseDirs::new()
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;

        Ok(base.home_dir().join(".lark-base-relay").join("config.toml"))
    }

    /// Apply the flat environment-style configuration surface.
    ///
    /// `LARK_CHAT_APP_ID` / `LARK_CHAT_APP_SECRET` take precedence over
    /// `LARK_APP_ID` / `LARK_APP_SECRET` when both are set.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("LARK_CHAT_APP_ID").or_else(|| get("LARK_APP_ID")) {
            self.lark.app_id = v;
        }
        if let Some(v) = get("LARK_CHAT_APP_SECRET").or_else(|| get("LARK_APP_SECRET")) {
            self.lark.app_secret = v;
        }
        if let Some(v) = get("LARK_VERIFICATION_TOKEN") {
            self.lark.verification_token = Some(v);
        }
        if let Some(v) = get("LARK_ENCRYPT_KEY") {
            self.lark.encrypt_key = Some(v);
        }
        if let Some(v) = get("LARK_BOT_OPEN_ID") {
            self.lark.bot_open_id = Some(v);
        }
        if let Some(v) = get("LARK_BASE_APP_ID") {
            self.bitable.app_id = Some(v);
        }
        if let Some(v) = get("LARK_BASE_APP_SECRET") {
            self.bitable.app_secret = Some(v);
        }
        if let Some(v) = get("LARK_BASE_APP_TOKEN") {
            self.bitable.app_token = v;
        }
        if let Some(v) = get("LARK_BASE_TABLE_ID") {
            self.bitable.table_id = v;
        }
        if let Some(v) = get("GEMINI_KEY") {
            self.gemini.api_key = v;
        }
        if let Some(v) = get("GEMINI_MODEL") {
            self.gemini.model = v;
        }
        if let Some(v) = get("PORT") {
            self.server.port = v.trim().parse().context("PORT must be a port number")?;
        }
        if let Some(v) = get("DEDUP_CAPACITY") {
            self.dedup.capacity = v.trim().parse().context("DEDUP_CAPACITY must be an integer")?;
        }
        if let Some(v) = get("DEDUP_TTL_SECONDS") {
            self.dedup.ttl_seconds = v
                .trim()
                .parse()
                .context("DEDUP_TTL_SECONDS must be an integer")?;
        }
        if let Some(v) = get("FETCH_MAX_ATTEMPTS") {
            self.fetch.max_attempts = v
                .trim()
                .parse()
                .context("FETCH_MAX_ATTEMPTS must be an integer")?;
        }
        if let Some(v) = get("FETCH_BACKOFF_MS") {
            self.fetch.backoff_ms = v.trim().parse().context("FETCH_BACKOFF_MS must be an integer")?;
        }
        if let Some(v) = get("FETCH_POLICY") {
            self.fetch.policy = v.parse()?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.dedup.capacity == 0 {
            anyhow::bail!("dedup.capacity must be greater than zero");
        }
        if self.dedup.ttl_seconds == 0 {
            anyhow::bail!("dedup.ttl_seconds must be greater than zero");
        }
        if self.fetch.max_attempts == 0 {
            anyhow::bail!("fetch.max_attempts must be at least 1");
        }
        if self.server.reply_queue_capacity == 0 {
            anyhow::bail!("server.reply_queue_capacity must be greater than zero");
        }
        if self.server.max_concurrent_replies == 0 {
            anyhow::bail!("server.max_concurrent_replies must be greater than zero");
        }
        if self.bitable.page_size == 0 || self.bitable.page_size > 500 {
            anyhow::bail!(
                "bitable.page_size must be between 1 and 500 (got {})",
                self.bitable.page_size
            );
        }
        if !self.bitable.table_id.is_empty() && !TABLE_ID_RE.is_match(&self.bitable.table_id) {
            anyhow::bail!(
                "Invalid bitable.table_id '{}'. Expected an id like tblXXXXXXXX",
                self.bitable.table_id
            );
        }
        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => anyhow::bail!("logging.format must be 'text' or 'json' (got '{}')", other),
        }

        Ok(())
    }

    /// Stricter checks for `serve`: every collaborator needs credentials.
    pub fn validate_for_serving(&self) -> Result<()> {
        let (app_id, app_secret) = self.bitable.credentials(&self.lark);
        if self.lark.app_id.is_empty() || self.lark.app_secret.is_empty() {
            anyhow::bail!("Lark app credentials are missing (LARK_APP_ID / LARK_APP_SECRET)");
        }
        if app_id.is_empty() || app_secret.is_empty() {
            anyhow::bail!("Lark Base credentials are missing");
        }
        if self.bitable.app_token.is_empty() || self.bitable.table_id.is_empty() {
            anyhow::bail!("Lark Base app token and table id are required (LARK_BASE_APP_TOKEN / LARK_BASE_TABLE_ID)");
        }
        if self.gemini.api_key.is_empty() {
            anyhow::bail!("Gemini API key is missing (GEMINI_KEY)");
        }
        Ok(())
    }

    /// Copy of the config with secrets masked, for display.
    pub fn redacted(&self) -> Config {
        let mut c = self.clone();
        redact(&mut c.lark.app_secret);
        redact(&mut c.gemini.api_key);
        if let Some(ref mut s) = c.bitable.app_secret {
            redact(s);
        }
        if let Some(ref mut s) = c.lark.verification_token {
            redact(s);
        }
        if let Some(ref mut s) = c.lark.encrypt_key {
            redact(s);
        }
        c
    }

    pub fn transcript_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.transcript.path).to_string())
    }

    fn expand_env_vars(&mut self) {
        self.lark.app_id = expand_env(&self.lark.app_id);
        self.lark.app_secret = expand_env(&self.lark.app_secret);
        self.gemini.api_key = expand_env(&self.gemini.api_key);
        self.bitable.app_token = expand_env(&self.bitable.app_token);
        if let Some(ref mut secret) = self.bitable.app_secret {
            *secret = expand_env(secret);
        }
        if let Some(ref mut token) = self.lark.verification_token {
            *token = expand_env(token);
        }
        if let Some(ref mut key) = self.lark.encrypt_key {
            *key = expand_env(key);
        }
    }
}

fn redact(s: &mut String) {
    if !s.is_empty() {
        *s = "***".to_string();
    }
}

pub(crate) fn expand_env(s: &str) -> String {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else if let Some(var_name) = s.strip_prefix('$') {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else {
        s.to_string()
    }
}
