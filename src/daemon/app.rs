use crate::core::cache::{FileMemoryStore, FileSnapshotCache, NotificationMemoryStore, SnapshotCache};
use crate::core::credentials::{CredentialProvider, CredentialsWatcher, FileCredentialProvider};
use crate::core::error::FetchError;
use crate::core::models::UsageSnapshot;
use crate::core::notifications::{DesktopNotificationSink, NotificationSink};
use crate::core::pipeline::{CredentialedFetch, FetchPipeline};
use crate::core::settings::Settings;
use crate::core::store::{UsageStatus, UsageStore};
use crate::core::thresholds::{OutboundNotification, ThresholdConfig, ThresholdEngine};
use crate::daemon::dbus::start_dbus_server;
use crate::daemon::polling::{LoopEvent, PollingLoop};
use crate::daemon::signals;
use crate::providers::ClaudeProvider;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub async fn run(settings: Settings) -> Result<()> {
    let credentials: Arc<dyn CredentialProvider> = Arc::new(FileCredentialProvider::new());
    let provider = Arc::new(ClaudeProvider::new(&settings)?);
    let pipeline = FetchPipeline::from_settings(provider, &settings.retry);
    let hint = pipeline.credential_error_hint();
    let source = Arc::new(CredentialedFetch::new(Arc::clone(&credentials), pipeline));

    let collaborators = Collaborators {
        cache: Arc::new(FileSnapshotCache::new()?),
        memory: Arc::new(FileMemoryStore::new()?),
        sink: Arc::new(DesktopNotificationSink::new()),
        credentials: Arc::clone(&credentials),
    };
    let store = UsageStore::new();
    let app = AppState::new(&settings, store.clone(), collaborators, hint);

    let (event_tx, event_rx) = mpsc::unbounded_channel::<LoopEvent>();

    let _cred_watcher = match credentials.watch_path() {
        Some(path) => match CredentialsWatcher::start(path) {
            Ok((watcher, mut changes)) => {
                let tx = event_tx.clone();
                tokio::spawn(async move {
                    while let Some(path) = changes.recv().await {
                        tracing::debug!(path = %path.display(), "Credentials file changed");
                        if tx.send(LoopEvent::CredentialsChanged).is_err() {
                            break;
                        }
                    }
                });
                Some(watcher)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to watch credentials file");
                None
            }
        },
        None => None,
    };

    let _dbus_connection = match start_dbus_server(event_tx.clone(), store).await {
        Ok(connection) => Some(connection),
        Err(e) => {
            tracing::warn!(error = %e, "D-Bus service unavailable, remote commands disabled");
            None
        }
    };

    signals::spawn_system_watchers(event_tx.clone());

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            let _ = shutdown_tx.send(LoopEvent::Shutdown);
        }
    });

    PollingLoop::new(&settings, app, source, event_rx).run().await;
    Ok(())
}

pub struct Collaborators {
    pub cache: Arc<dyn SnapshotCache>,
    pub memory: Arc<dyn NotificationMemoryStore>,
    pub sink: Arc<dyn NotificationSink>,
    pub credentials: Arc<dyn CredentialProvider>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    ShowingCached,
    ReauthRequired,
    Surfaced,
}

/// Turns fetch outcomes into display state, cache writes and alerts.
pub struct AppState {
    store: UsageStore,
    cache: Arc<dyn SnapshotCache>,
    sink: Arc<dyn NotificationSink>,
    credentials: Arc<dyn CredentialProvider>,
    thresholds: ThresholdEngine,
    notifications_enabled: bool,
    credential_warning: Duration,
    cache_max_age: Duration,
    credential_hint: String,
}

impl AppState {
    pub fn new(
        settings: &Settings,
        store: UsageStore,
        collaborators: Collaborators,
        credential_hint: &str,
    ) -> Self {
        let config = ThresholdConfig::from_settings(&settings.notifications);

        Self {
            store,
            cache: collaborators.cache,
            sink: collaborators.sink,
            credentials: collaborators.credentials,
            thresholds: ThresholdEngine::new(config, collaborators.memory),
            notifications_enabled: settings.notifications.enabled,
            credential_warning: Duration::from_secs(
                settings.notifications.credential_expiry_warning_secs,
            ),
            cache_max_age: settings.cache.max_age(),
            credential_hint: credential_hint.to_string(),
        }
    }

    pub async fn has_data(&self) -> bool {
        self.store.has_data().await
    }

    /// Shows the last-known snapshot from a previous run. It is never used as
    /// the baseline for threshold evaluation.
    pub async fn load_cached(&self) {
        match self.cache.load_last_known(Some(self.cache_max_age)) {
            Ok(Some(snapshot)) => {
                tracing::info!(fetched_at = %snapshot.fetched_at, "Loaded cached usage");
                self.store
                    .show_cached(snapshot, "cached from previous session".to_string())
                    .await;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to load cached usage"),
        }
    }

    pub async fn apply_success(&mut self, snapshot: UsageSnapshot, now: DateTime<Utc>) {
        if let Err(e) = self.cache.store(&snapshot) {
            tracing::warn!(error = %e, "Failed to cache usage snapshot");
        }

        let previous = self.store.record_fetch(snapshot.clone()).await;
        tracing::debug!(
            max_utilization = snapshot.max_utilization(),
            "Usage updated"
        );

        if !self.notifications_enabled {
            return;
        }

        match self.thresholds.evaluate(previous.as_ref(), &snapshot, now) {
            Ok(outcome) => {
                for notification in &outcome.notifications {
                    self.dispatch(notification);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to persist notification memory, skipping alerts");
            }
        }

        self.check_credential_expiry(now);
    }

    pub async fn apply_failure(&mut self, error: &FetchError) -> FailureDisposition {
        if error.requires_reauth() {
            self.store
                .set_status(UsageStatus::ReauthRequired {
                    hint: self.credential_hint.clone(),
                })
                .await;
            return FailureDisposition::ReauthRequired;
        }

        tracing::warn!(error = %error, class = ?error.class(), "Failed to fetch usage");

        if error.is_transient() {
            match self.cache.load_last_known(None) {
                Ok(Some(snapshot)) => {
                    self.store.show_cached(snapshot, error.to_string()).await;
                    return FailureDisposition::ShowingCached;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to load cached usage"),
            }
        }

        self.store
            .set_status(UsageStatus::Error {
                message: error.to_string(),
            })
            .await;
        FailureDisposition::Surfaced
    }

    pub async fn set_degraded(&self) {
        self.store.set_status(UsageStatus::Degraded).await;
    }

    pub async fn invalidate_stale(&self) {
        self.store.invalidate_display().await;
    }

    fn check_credential_expiry(&mut self, now: DateTime<Utc>) {
        let Ok(token) = self.credentials.get_token() else {
            return;
        };
        let Some(expires_at) = token.expires_at else {
            return;
        };

        match self
            .thresholds
            .credential_expiring(expires_at, now, self.credential_warning)
        {
            Ok(Some(notification)) => self.dispatch(&notification),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to persist notification memory"),
        }
    }

    fn dispatch(&self, notification: &OutboundNotification) {
        if let Err(e) = self.sink.send(
            &notification.title,
            &notification.body,
            &notification.dedupe_id,
        ) {
            tracing::warn!(error = %e, kind = %notification.kind.key(), "Failed to send notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::testing::{InMemoryMemoryStore, MemorySnapshotCache};
    use crate::core::credentials::testing::StaticCredentialProvider;
    use crate::core::credentials::AccessToken;
    use crate::core::notifications::testing::RecordingSink;
    use crate::core::pipeline::testing::snapshot_at;

    struct Fixture {
        app: AppState,
        store: UsageStore,
        sink: Arc<RecordingSink>,
        memory: Arc<InMemoryMemoryStore>,
    }

    fn fixture_with(
        cache: MemorySnapshotCache,
        expires_at: Option<DateTime<Utc>>,
    ) -> Fixture {
        let store = UsageStore::new();
        let sink = Arc::new(RecordingSink::new());
        let memory = Arc::new(InMemoryMemoryStore::new());
        let collaborators = Collaborators {
            cache: Arc::new(cache),
            memory: memory.clone(),
            sink: sink.clone(),
            credentials: Arc::new(StaticCredentialProvider::new(AccessToken::new(
                "token", expires_at,
            ))),
        };
        let app = AppState::new(&Settings::default(), store.clone(), collaborators, "run `claude`");

        Fixture {
            app,
            store,
            sink,
            memory,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MemorySnapshotCache::new(), None)
    }

    #[tokio::test]
    async fn test_success_evaluates_against_previous_fetch() {
        let mut f = fixture();
        let t0 = Utc::now();

        f.app.apply_success(snapshot_at(60.0), t0).await;
        assert!(f.sink.sent().is_empty());

        f.app
            .apply_success(snapshot_at(92.0), t0 + chrono::Duration::minutes(1))
            .await;
        let sent = f.sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "Claude usage reached 90%");
        assert_eq!(sent[0].dedupe_id, "claude-meter-threshold-90");
        assert_eq!(f.store.status().await, UsageStatus::Fresh);
    }

    #[tokio::test]
    async fn test_cached_snapshot_is_not_a_baseline() {
        let mut f = fixture_with(MemorySnapshotCache::with_snapshot(snapshot_at(80.0)), None);
        f.app.load_cached().await;
        assert!(matches!(f.store.status().await, UsageStatus::Stale { .. }));

        // Compared against nothing, so 80% is a fresh crossing of 75%.
        f.app.apply_success(snapshot_at(80.0), Utc::now()).await;
        assert_eq!(f.sink.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_falls_back_to_cache() {
        let mut f = fixture();
        f.app.apply_success(snapshot_at(40.0), Utc::now()).await;

        let exhausted = FetchError::MaxRetriesExceeded {
            attempts: 3,
            last: Box::new(FetchError::Network("timed out".into())),
        };
        let disposition = f.app.apply_failure(&exhausted).await;

        assert_eq!(disposition, FailureDisposition::ShowingCached);
        assert!(f.store.has_data().await);
        assert!(matches!(f.store.status().await, UsageStatus::Stale { .. }));
    }

    #[tokio::test]
    async fn test_auth_failure_does_not_mask_with_cache() {
        let mut f = fixture_with(MemorySnapshotCache::with_snapshot(snapshot_at(30.0)), None);

        let disposition = f.app.apply_failure(&FetchError::Unauthorized).await;

        assert_eq!(disposition, FailureDisposition::ReauthRequired);
        assert_eq!(
            f.store.status().await,
            UsageStatus::ReauthRequired {
                hint: "run `claude`".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_protocol_failure_is_surfaced() {
        let mut f = fixture_with(MemorySnapshotCache::with_snapshot(snapshot_at(30.0)), None);

        let disposition = f
            .app
            .apply_failure(&FetchError::Decode("missing field".into()))
            .await;

        assert_eq!(disposition, FailureDisposition::Surfaced);
        assert!(matches!(f.store.status().await, UsageStatus::Error { .. }));
    }

    #[tokio::test]
    async fn test_credential_expiry_warning_is_throttled() {
        let now = Utc::now();
        let mut f = fixture_with(
            MemorySnapshotCache::new(),
            Some(now + chrono::Duration::minutes(10)),
        );

        f.app.apply_success(snapshot_at(10.0), now).await;
        f.app
            .apply_success(snapshot_at(10.0), now + chrono::Duration::minutes(1))
            .await;

        let sent = f.sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].dedupe_id, "claude-meter-credential-expiring");
    }

    #[tokio::test]
    async fn test_failed_memory_write_suppresses_alerts() {
        let mut f = fixture();
        f.memory.fail_saves(true);
        let t0 = Utc::now();

        f.app.apply_success(snapshot_at(60.0), t0).await;
        f.app
            .apply_success(snapshot_at(80.0), t0 + chrono::Duration::minutes(1))
            .await;
        assert!(f.sink.sent().is_empty());

        f.memory.fail_saves(false);
        f.app
            .apply_success(snapshot_at(81.0), t0 + chrono::Duration::minutes(2))
            .await;
        // Memory never recorded the crossing, and 80 -> 81 is not a new one.
        assert!(f.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_clears_display() {
        let mut f = fixture();
        f.app.apply_success(snapshot_at(50.0), Utc::now()).await;
        f.app.invalidate_stale().await;

        assert!(!f.app.has_data().await);
    }
}
