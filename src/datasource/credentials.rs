use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::error::AuthError;
use crate::clock::Clock;

/// What a successful auth exchange hands back.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub token: String,
    pub lifetime: Duration,
}

/// Performs the credential exchange against the upstream API.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn exchange(&self) -> Result<TokenGrant, AuthError>;
}

#[derive(Clone)]
pub struct AccessToken {
    value: String,
    expires_at: Instant,
}

impl AccessToken {
    pub fn new(value: String, expires_at: Instant) -> Self {
        Self { value, expires_at }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// True while `now` is strictly before `expires_at - margin`.
    pub fn is_fresh(&self, now: Instant, margin: Duration) -> bool {
        now + margin < self.expires_at
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Holds one short-lived bearer token and refreshes it on expiry.
///
/// The lock is never held across the exchange, so concurrent callers that
/// all find the token stale will each refresh it. The last writer wins.
pub struct CredentialCache {
    source: Arc<dyn TokenSource>,
    clock: Arc<dyn Clock>,
    safety_margin: Duration,
    cached: RwLock<Option<AccessToken>>,
}

impl CredentialCache {
    pub fn new(source: Arc<dyn TokenSource>, clock: Arc<dyn Clock>, safety_margin: Duration) -> Self {
        Self {
            source,
            clock,
            safety_margin,
            cached: RwLock::new(None),
        }
    }

    pub async fn get_token(&self) -> Result<AccessToken, AuthError> {
        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref() {
                if token.is_fresh(self.clock.now(), self.safety_margin) {
                    return Ok(token.clone());
                }
                debug!("Cached access token is within its safety margin, refreshing");
            }
        }

        let grant = self.source.exchange().await?;
        let token = AccessToken::new(grant.token, self.clock.now() + grant.lifetime);

        *self.cached.write().await = Some(token.clone());
        info!("Obtained access token valid for {}s", grant.lifetime.as_secs());

        Ok(token)
    }

    /// Drop the cached token so the next call re-authenticates.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }
}
