use crate::core::models::UsageSnapshot;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UsageStatus {
    Loading,
    Fresh,
    /// Showing last-known data because the latest fetch failed transiently.
    Stale { reason: String },
    /// Breaker is open; polling has slowed down.
    Degraded,
    ReauthRequired { hint: String },
    Error { message: String },
}

struct StoreInner {
    display: Option<UsageSnapshot>,
    last_fetched: Option<UsageSnapshot>,
    status: UsageStatus,
}

impl Default for StoreInner {
    fn default() -> Self {
        Self {
            display: None,
            last_fetched: None,
            status: UsageStatus::Loading,
        }
    }
}

/// What the UI shell reads. `display` may come from the cache; `last_fetched`
/// only ever holds a snapshot fetched by this process.
#[derive(Clone, Default)]
pub struct UsageStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl UsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_snapshot(&self) -> Option<UsageSnapshot> {
        self.inner.read().await.display.clone()
    }

    pub async fn has_data(&self) -> bool {
        self.inner.read().await.display.is_some()
    }

    pub async fn status(&self) -> UsageStatus {
        self.inner.read().await.status.clone()
    }

    /// Stores a freshly fetched snapshot and hands back the one it replaces.
    pub async fn record_fetch(&self, snapshot: UsageSnapshot) -> Option<UsageSnapshot> {
        let mut inner = self.inner.write().await;
        inner.display = Some(snapshot.clone());
        inner.status = UsageStatus::Fresh;
        inner.last_fetched.replace(snapshot)
    }

    pub async fn show_cached(&self, snapshot: UsageSnapshot, reason: String) {
        let mut inner = self.inner.write().await;
        inner.display = Some(snapshot);
        inner.status = UsageStatus::Stale { reason };
    }

    pub async fn set_status(&self, status: UsageStatus) {
        self.inner.write().await.status = status;
    }

    pub async fn invalidate_display(&self) {
        let mut inner = self.inner.write().await;
        inner.display = None;
        inner.status = UsageStatus::Loading;
    }
}
