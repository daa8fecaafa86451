//! Bearer credential cache for the composable-infrastructure services
//!
//! Every outbound call to the fabric inventory or the policy service needs a
//! bearer token. `CredentialCache` hands out one shared credential to all
//! callers and refreshes it once it comes within `margin` of its expiry.
//!
//! The read-check-refresh-write sequence runs under a single async mutex, so
//! concurrent callers never observe a half-updated credential and at most one
//! refresh is in flight. A failed refresh keeps the previous credential and
//! serves it for as long as it has not actually expired.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{ClientError, IdentityService};
use crate::config::{IdentitySecret, SecretError, DRA_NAMESPACE, SECRET_NAME};
use crate::context::RequestContext;
use crate::kube::{ClusterApi, KubeError};

/// A credential is refreshed once it is this close to its expiry
pub const DEFAULT_MARGIN_SECS: i64 = 30;

/// Source of the current time, injectable for tests
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Failed to read identity secret: {0}")]
    SecretRead(#[from] KubeError),

    #[error("Invalid identity secret: {0}")]
    Secret(#[from] SecretError),

    #[error("Identity service call failed: {0}")]
    Issue(#[from] ClientError),

    #[error("Invalid access token: {0}")]
    Malformed(String),
}

/// A bearer token with its absolute expiry
#[derive(Clone, PartialEq)]
pub struct Credential {
    pub token: String,
    pub expiry: DateTime<Utc>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl Credential {
    pub fn new(token: impl Into<String>, expiry: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expiry,
        }
    }

    /// Build a credential from a JWT, taking the expiry from its `exp` claim
    pub fn from_jwt(token: impl Into<String>) -> Result<Self, TokenError> {
        let token = token.into();
        let expiry = jwt_expiry(&token)?;
        Ok(Self { token, expiry })
    }

    /// Usable without refresh: `now < expiry - margin`
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now < self.expiry - margin
    }

    /// Not yet expired at all
    pub fn is_unexpired(&self, now: DateTime<Utc>) -> bool {
        now < self.expiry
    }
}

#[derive(Deserialize)]
struct AccessTokenClaims {
    exp: i64,
}

/// Extract the `exp` claim of a JWT without verifying its signature
pub fn jwt_expiry(token: &str) -> Result<DateTime<Utc>, TokenError> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next()) {
        (Some(_), Some(payload)) => payload,
        _ => return Err(TokenError::Malformed("expected at least two segments".to_string())),
    };

    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| TokenError::Malformed(format!("failed to decode base64: {}", e)))?;

    let claims: AccessTokenClaims = serde_json::from_slice(&decoded)
        .map_err(|e| TokenError::Malformed(format!("failed to unmarshal JSON: {}", e)))?;

    DateTime::from_timestamp(claims.exp, 0)
        .ok_or_else(|| TokenError::Malformed(format!("exp {} out of range", claims.exp)))
}

// ============================================================================
// Token sources
// ============================================================================

/// Anything able to mint a fresh credential
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<Credential, TokenError>;
}

/// Reads the identity secret and asks the identity service for a token
pub struct IdentityTokenSource {
    identity: Arc<dyn IdentityService>,
    cluster: Arc<dyn ClusterApi>,
}

impl IdentityTokenSource {
    pub fn new(identity: Arc<dyn IdentityService>, cluster: Arc<dyn ClusterApi>) -> Self {
        Self { identity, cluster }
    }
}

#[async_trait]
impl TokenSource for IdentityTokenSource {
    async fn fetch(&self) -> Result<Credential, TokenError> {
        let ctx = RequestContext::detached();

        let data = self
            .cluster
            .get_secret(&ctx, DRA_NAMESPACE, SECRET_NAME)
            .await?;
        let secret = IdentitySecret::from_secret_data(data.as_ref())?;

        debug!("Requesting identity token, requestID={}", ctx.request_id());
        let token = self.identity.issue_token(&ctx, &secret).await.map_err(|e| {
            error!("Identity token API failed, requestID={}", ctx.request_id());
            e
        })?;
        debug!(
            "Identity token API completed successfully, requestID={}",
            ctx.request_id()
        );

        Credential::from_jwt(token)
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Shared, self-refreshing bearer credential
pub struct CredentialCache {
    source: Box<dyn TokenSource>,
    margin: Duration,
    clock: Clock,
    cached: Mutex<Option<Credential>>,
}

impl CredentialCache {
    pub fn new(source: impl TokenSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            margin: Duration::seconds(DEFAULT_MARGIN_SECS),
            clock: Arc::new(Utc::now),
            cached: Mutex::new(None),
        }
    }

    /// Refresh this long before expiry
    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    /// Replace the wall clock
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn margin(&self) -> Duration {
        self.margin
    }

    /// Return a usable credential, refreshing it when needed
    ///
    /// On refresh failure the previous credential is served while it is still
    /// unexpired; the error only surfaces when there is nothing to fall back to.
    pub async fn obtain(&self) -> Result<Credential, TokenError> {
        let mut cached = self.cached.lock().await;
        let now = (self.clock)();

        if let Some(credential) = cached.as_ref() {
            if credential.is_fresh(now, self.margin) {
                debug!("Using cached credential");
                return Ok(credential.clone());
            }
        }

        debug!("Trying to issue a new credential");
        match self.source.fetch().await {
            Ok(fresh) => {
                info!("New credential issued, expires at {}", fresh.expiry);
                *cached = Some(fresh.clone());
                Ok(fresh)
            }
            Err(e) => match cached.as_ref() {
                Some(previous) if previous.is_unexpired(now) => {
                    error!("Unable to rotate credential, serving the previous one: {}", e);
                    Ok(previous.clone())
                }
                _ => {
                    error!("Failed to issue new credential: {}", e);
                    Err(e)
                }
            },
        }
    }
}
