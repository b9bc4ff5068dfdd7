use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::sender::SendError;

/// Refresh this long before the provider-reported expiry
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(300);

/// A freshly issued bearer token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_in: Duration,
}

/// Provider endpoint that hands out access tokens
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self, cancel: &CancellationToken) -> Result<IssuedToken, SendError>;
}

#[derive(Debug, Clone)]
struct Credential {
    token: String,
    expires_at: Instant,
}

impl Credential {
    fn is_fresh(&self, now: Instant) -> bool {
        !self.token.is_empty() && now < self.expires_at
    }
}

/// Lazily fetched, shared access token.
///
/// Reads take the shared lock; a miss escalates to the exclusive lock and
/// re-checks before calling the issuer, so concurrent misses collapse into
/// one issuance. A failed issuance leaves any cached credential untouched.
pub struct TokenCache {
    issuer: Arc<dyn TokenIssuer>,
    credential: RwLock<Option<Credential>>,
}

impl TokenCache {
    pub fn new(issuer: Arc<dyn TokenIssuer>) -> Self {
        Self {
            issuer,
            credential: RwLock::new(None),
        }
    }

    pub async fn get_token(&self, cancel: &CancellationToken) -> Result<String, SendError> {
        if let Some(token) = self.cached(&*self.credential.read().await) {
            return Ok(token);
        }

        let mut guard = self.credential.write().await;
        if let Some(token) = self.cached(&guard) {
            debug!("Access token refreshed by a concurrent caller");
            return Ok(token);
        }

        let issued = self
            .issuer
            .issue(cancel)
            .await
            .map_err(|e| SendError::Token(Box::new(e)))?;

        let lifetime = issued.expires_in.saturating_sub(EXPIRY_MARGIN);
        *guard = Some(Credential {
            token: issued.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        info!(valid_for_secs = lifetime.as_secs(), "Access token refreshed");

        Ok(issued.access_token)
    }

    /// Drop the cached credential so the next call refreshes it
    pub async fn invalidate(&self) {
        *self.credential.write().await = None;
    }

    fn cached(&self, credential: &Option<Credential>) -> Option<String> {
        credential
            .as_ref()
            .filter(|c| c.is_fresh(Instant::now()))
            .map(|c| c.token.clone())
    }
}
