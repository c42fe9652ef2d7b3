mod claude;

use crate::core::credentials::AccessToken;
use crate::core::error::FetchError;
use crate::core::models::UsageSnapshot;
use async_trait::async_trait;

pub use claude::ClaudeProvider;

/// A single, non-retried request against the remote usage API.
#[async_trait]
pub trait UsageProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch_usage(&self, token: &AccessToken) -> Result<UsageSnapshot, FetchError>;
    fn credential_error_hint(&self) -> &'static str;
}
