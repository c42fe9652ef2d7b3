use crate::core::credentials::{AccessToken, CredentialProvider};
use crate::core::error::FetchError;
use crate::core::models::UsageSnapshot;
use crate::core::retry::BackoffPolicy;
use crate::core::settings::RetrySettings;
use crate::providers::UsageProvider;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

/// Produces one usage snapshot per call, however it gets there. The polling
/// loop only ever talks to this.
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn fetch_current(&self) -> Result<UsageSnapshot, FetchError>;
}

pub struct FetchPipeline {
    provider: Arc<dyn UsageProvider>,
    policy: BackoffPolicy,
    max_attempts: u32,
}

impl FetchPipeline {
    pub fn new(provider: Arc<dyn UsageProvider>, policy: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            provider,
            policy,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_settings(provider: Arc<dyn UsageProvider>, settings: &RetrySettings) -> Self {
        Self::new(
            provider,
            BackoffPolicy::from_settings(settings),
            settings.max_attempts,
        )
    }

    pub fn credential_error_hint(&self) -> &'static str {
        self.provider.credential_error_hint()
    }

    pub async fn fetch(&self, token: &AccessToken) -> Result<UsageSnapshot, FetchError> {
        if token.is_expired(Utc::now()) {
            if let Some(expires_at) = token.expires_at {
                return Err(FetchError::TokenExpired(expires_at));
            }
        }
        self.provider.fetch_usage(token).await
    }

    pub async fn fetch_with_retry(&self, token: &AccessToken) -> Result<UsageSnapshot, FetchError> {
        let mut attempt = 0;

        loop {
            let err = match self.fetch(token).await {
                Ok(snapshot) => {
                    if attempt > 0 {
                        tracing::info!(
                            provider = self.provider.name(),
                            attempt,
                            "Usage fetch succeeded after retry"
                        );
                    }
                    return Ok(snapshot);
                }
                Err(err) => err,
            };

            let class = err.class();
            let Some(delay) = self.policy.delay_for(attempt, class) else {
                tracing::debug!(
                    provider = self.provider.name(),
                    ?class,
                    error = %err,
                    "Usage fetch failed, not retryable"
                );
                return Err(err);
            };

            attempt += 1;
            if attempt >= self.max_attempts {
                tracing::warn!(
                    provider = self.provider.name(),
                    attempts = self.max_attempts,
                    error = %err,
                    "Usage fetch gave up"
                );
                return Err(FetchError::MaxRetriesExceeded {
                    attempts: self.max_attempts,
                    last: Box::new(err),
                });
            }

            tracing::warn!(
                provider = self.provider.name(),
                attempt,
                max_attempts = self.max_attempts,
                ?class,
                error = %err,
                delay_secs = delay.as_secs_f64(),
                "Usage fetch failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Single attempt, no retries. Used for credential health checks.
    pub async fn validate_token(&self, token: &AccessToken) -> bool {
        match self.fetch(token).await {
            Ok(_) => true,
            Err(e) => {
                tracing::info!(error = %e, "Token validation failed");
                false
            }
        }
    }
}

/// Looks up the current token for every fetch so renewed credentials are
/// picked up without a restart.
pub struct CredentialedFetch {
    credentials: Arc<dyn CredentialProvider>,
    pipeline: FetchPipeline,
}

impl CredentialedFetch {
    pub fn new(credentials: Arc<dyn CredentialProvider>, pipeline: FetchPipeline) -> Self {
        Self {
            credentials,
            pipeline,
        }
    }
}

#[async_trait]
impl UsageSource for CredentialedFetch {
    async fn fetch_current(&self) -> Result<UsageSnapshot, FetchError> {
        let token = self.credentials.get_token()?;
        self.pipeline.fetch_with_retry(&token).await
    }
}
