use crate::core::error::FetchError;
use crate::core::models::UsageSnapshot;
use crate::core::pipeline::UsageSource;
use crate::core::settings::Settings;
use crate::daemon::app::{AppState, FailureDisposition};
use crate::daemon::scheduler::PollingScheduler;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Requests from the outside world: D-Bus, system signals, file watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    Refresh,
    Foreground,
    Background,
    Pause,
    Resume,
    Suspend,
    Wake,
    NetworkLost,
    NetworkRestored,
    CredentialsChanged,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Startup,
    Timer,
    Manual,
    Foreground,
    NetworkRestored,
    CredentialsChanged,
    WakeRecovery,
}

enum Internal {
    FetchCompleted(Result<UsageSnapshot, FetchError>),
    WakeAttempt {
        generation: u64,
        reply: oneshot::Sender<bool>,
    },
    WakeFinished {
        generation: u64,
        recovered: bool,
    },
}

struct WakeRecovery {
    generation: u64,
    cancel: CancellationToken,
}

/// Owns the scheduler and app state. Everything that mutates either runs on
/// this loop; fetches run in spawned tasks and report back over a channel.
pub struct PollingLoop {
    scheduler: PollingScheduler,
    app: AppState,
    source: Arc<dyn UsageSource>,
    events: mpsc::UnboundedReceiver<LoopEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    significant_sleep: Duration,
    wake_retry_delays: Vec<Duration>,
    auth_blocked: bool,
    wake: Option<WakeRecovery>,
    wake_generation: u64,
    wake_waiters: Vec<oneshot::Sender<bool>>,
}

impl PollingLoop {
    pub fn new(
        settings: &Settings,
        app: AppState,
        source: Arc<dyn UsageSource>,
        events: mpsc::UnboundedReceiver<LoopEvent>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        Self {
            scheduler: PollingScheduler::new(&settings.polling),
            app,
            source,
            events,
            internal_tx,
            internal_rx,
            significant_sleep: settings.sleep.significant_sleep(),
            wake_retry_delays: settings.sleep.wake_retry_delays(),
            auth_blocked: false,
            wake: None,
            wake_generation: 0,
            wake_waiters: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        self.app.load_cached().await;
        self.scheduler.start(Instant::now());
        self.request_fetch(Trigger::Startup);

        loop {
            let deadline = self.scheduler.next_tick_at();

            tokio::select! {
                _ = sleep_until(deadline) => {
                    if self.scheduler.poll_due(Instant::now()) {
                        self.request_fetch(Trigger::Timer);
                    }
                }
                event = self.events.recv() => {
                    match event {
                        Some(LoopEvent::Shutdown) | None => break,
                        Some(event) => self.handle_event(event).await,
                    }
                }
                Some(msg) = self.internal_rx.recv() => {
                    self.handle_internal(msg).await;
                }
            }
        }

        self.cancel_wake_recovery();
        self.scheduler.stop();
        tracing::info!("Polling loop stopped");
    }

    fn request_fetch(&mut self, trigger: Trigger) -> bool {
        if self.auth_blocked && !matches!(trigger, Trigger::Manual | Trigger::CredentialsChanged) {
            tracing::debug!(?trigger, "Skipping fetch: waiting for new credentials");
            return false;
        }
        if trigger == Trigger::Timer && !self.scheduler.network_available() {
            tracing::debug!("Skipping fetch: network unavailable");
            return false;
        }
        if !self.scheduler.begin_fetch() {
            tracing::debug!(?trigger, "Fetch already in flight, dropping request");
            return false;
        }

        tracing::debug!(?trigger, "Fetching usage");
        let source = Arc::clone(&self.source);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = source.fetch_current().await;
            let _ = tx.send(Internal::FetchCompleted(result));
        });
        true
    }

    async fn handle_event(&mut self, event: LoopEvent) {
        let now = Instant::now();
        tracing::debug!(?event, "Loop event");

        match event {
            LoopEvent::Refresh => {
                self.request_fetch(Trigger::Manual);
            }
            LoopEvent::Foreground => {
                if self.scheduler.on_foreground(now) {
                    self.request_fetch(Trigger::Foreground);
                }
            }
            LoopEvent::Background => self.scheduler.on_background(now),
            LoopEvent::Pause => self.scheduler.pause(),
            LoopEvent::Resume => self.scheduler.resume(now),
            LoopEvent::Suspend => {
                self.cancel_wake_recovery();
                self.scheduler.on_suspend(Utc::now());
            }
            LoopEvent::Wake => self.handle_wake(now).await,
            LoopEvent::NetworkLost => {
                tracing::info!("Network connectivity lost");
                self.scheduler.set_network_available(false);
            }
            LoopEvent::NetworkRestored => {
                tracing::info!("Network connectivity restored");
                self.scheduler.set_network_available(true);
                if !self.app.has_data().await {
                    self.request_fetch(Trigger::NetworkRestored);
                }
            }
            LoopEvent::CredentialsChanged => {
                tracing::info!("Credentials changed on disk, resetting failure state");
                self.auth_blocked = false;
                self.scheduler.record_success(now);
                self.request_fetch(Trigger::CredentialsChanged);
            }
            LoopEvent::Shutdown => {}
        }
    }

    async fn handle_wake(&mut self, now: Instant) {
        let Some(slept) = self.scheduler.on_resume(Utc::now()) else {
            self.scheduler.resume_after_sleep(now);
            return;
        };

        self.cancel_wake_recovery();

        if slept < self.significant_sleep {
            self.scheduler.resume_after_sleep(now);
            return;
        }

        tracing::info!(
            slept_secs = slept.as_secs(),
            "Significant sleep, discarding stale data"
        );
        self.app.invalidate_stale().await;

        if !self.scheduler.paused_by_suspend() {
            tracing::info!("Polling paused by user, skipping wake recovery");
            return;
        }
        self.start_wake_recovery();
    }

    fn start_wake_recovery(&mut self) {
        self.wake_generation += 1;
        let generation = self.wake_generation;
        let cancel = CancellationToken::new();

        self.wake = Some(WakeRecovery {
            generation,
            cancel: cancel.clone(),
        });

        tracing::info!(generation, "Starting wake recovery");
        tokio::spawn(run_wake_recovery(
            generation,
            self.wake_retry_delays.clone(),
            cancel,
            self.internal_tx.clone(),
        ));
    }

    fn cancel_wake_recovery(&mut self) {
        if let Some(wake) = self.wake.take() {
            tracing::info!(generation = wake.generation, "Cancelling wake recovery");
            wake.cancel.cancel();
        }
        self.wake_waiters.clear();
    }

    fn is_current_wake(&self, generation: u64) -> bool {
        self.wake.as_ref().is_some_and(|w| w.generation == generation)
    }

    async fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::FetchCompleted(result) => self.handle_completion(result).await,
            Internal::WakeAttempt { generation, reply } => {
                if !self.is_current_wake(generation) {
                    tracing::debug!(generation, "Ignoring attempt from superseded wake recovery");
                    return;
                }
                if self.scheduler.in_flight() || self.request_fetch(Trigger::WakeRecovery) {
                    self.wake_waiters.push(reply);
                } else {
                    let _ = reply.send(false);
                }
            }
            Internal::WakeFinished {
                generation,
                recovered,
            } => {
                if !self.is_current_wake(generation) {
                    tracing::debug!(generation, "Ignoring superseded wake recovery");
                    return;
                }
                self.wake = None;
                tracing::info!(generation, recovered, "Wake recovery finished");
                self.scheduler.resume_after_sleep(Instant::now());
            }
        }
    }

    async fn handle_completion(&mut self, result: Result<UsageSnapshot, FetchError>) {
        self.scheduler.end_fetch();
        let now = Instant::now();
        let succeeded = result.is_ok();

        match result {
            Ok(snapshot) => {
                self.auth_blocked = false;
                self.scheduler.record_success(now);
                let usage = snapshot.max_utilization();
                self.app.apply_success(snapshot, Utc::now()).await;
                if let Some(usage) = usage {
                    self.scheduler.update_for_usage(usage, now);
                }
            }
            Err(err) => {
                let disposition = self.app.apply_failure(&err).await;
                self.scheduler.record_failure(now);

                if disposition == FailureDisposition::ReauthRequired {
                    tracing::warn!(
                        error = %err,
                        "Authentication failed, automatic refresh paused until credentials change"
                    );
                    self.auth_blocked = true;
                } else if self.scheduler.in_failure_backoff()
                    && (disposition == FailureDisposition::ShowingCached || err.is_transient())
                {
                    self.app.set_degraded().await;
                }
            }
        }

        for waiter in self.wake_waiters.drain(..) {
            let _ = waiter.send(succeeded);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_wake_recovery(
    generation: u64,
    delays: Vec<Duration>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<Internal>,
) {
    let mut recovered = false;

    for (attempt, delay) in delays.into_iter().enumerate() {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if tx
            .send(Internal::WakeAttempt {
                generation,
                reply: reply_tx,
            })
            .is_err()
        {
            return;
        }

        let ok = tokio::select! {
            _ = cancel.cancelled() => return,
            reply = reply_rx => reply.unwrap_or(false),
        };
        if ok {
            recovered = true;
            break;
        }
        tracing::debug!(generation, attempt, "Wake recovery attempt failed");
    }

    if !cancel.is_cancelled() {
        let _ = tx.send(Internal::WakeFinished {
            generation,
            recovered,
        });
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
    use crate::core::store::{UsageStatus, UsageStore};
    use crate::daemon::app::Collaborators;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    /// Each call takes one permit from `gate`, then replays the script. After
    /// the script runs out every call succeeds at 60%.
    struct GatedSource {
        calls: AtomicU32,
        gate: Semaphore,
        script: Mutex<VecDeque<Result<f64, FetchError>>>,
    }

    impl GatedSource {
        fn open(script: Vec<Result<f64, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                gate: Semaphore::new(1_000),
                script: Mutex::new(script.into()),
            })
        }

        fn closed(script: Vec<Result<f64, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                gate: Semaphore::new(0),
                script: Mutex::new(script.into()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UsageSource for GatedSource {
        async fn fetch_current(&self) -> Result<UsageSnapshot, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(pct)) => Ok(snapshot_at(pct)),
                Some(Err(e)) => Err(e),
                None => Ok(snapshot_at(60.0)),
            }
        }
    }

    struct Harness {
        events: mpsc::UnboundedSender<LoopEvent>,
        store: UsageStore,
        sink: Arc<RecordingSink>,
    }

    fn spawn_loop(settings: Settings, source: Arc<GatedSource>) -> Harness {
        let store = UsageStore::new();
        let sink = Arc::new(RecordingSink::new());
        let collaborators = Collaborators {
            cache: Arc::new(MemorySnapshotCache::new()),
            memory: Arc::new(InMemoryMemoryStore::new()),
            sink: sink.clone(),
            credentials: Arc::new(StaticCredentialProvider::new(AccessToken::new(
                "token",
                Some(Utc::now() + chrono::Duration::days(30)),
            ))),
        };
        let app = AppState::new(&settings, store.clone(), collaborators, "sign in");
        let (events, rx) = mpsc::unbounded_channel();

        tokio::spawn(PollingLoop::new(&settings, app, source, rx).run());

        Harness {
            events,
            store,
            sink,
        }
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_while_in_flight_are_dropped() {
        let source = GatedSource::closed(vec![]);
        let h = spawn_loop(Settings::default(), source.clone());
        advance(1).await;
        assert_eq!(source.calls(), 1);

        h.events.send(LoopEvent::Refresh).unwrap();
        h.events.send(LoopEvent::Refresh).unwrap();
        advance(120).await;
        assert_eq!(source.calls(), 1);

        source.gate.add_permits(1);
        advance(1).await;
        assert!(h.store.has_data().await);

        source.gate.add_permits(10);
        h.events.send(LoopEvent::Refresh).unwrap();
        advance(1).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_polls_at_interval() {
        let source = GatedSource::open(vec![]);
        let _h = spawn_loop(Settings::default(), source.clone());

        advance(1).await;
        assert_eq!(source.calls(), 1);
        advance(58).await;
        assert_eq!(source.calls(), 1);
        advance(2).await;
        assert_eq!(source.calls(), 2);
        advance(60).await;
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_degrades_polling() {
        let failures = (0..5)
            .map(|_| Err(FetchError::Network("unreachable".into())))
            .collect();
        let source = GatedSource::open(failures);
        let h = spawn_loop(Settings::default(), source.clone());

        advance(241).await;
        assert_eq!(source.calls(), 5);
        assert_eq!(h.store.status().await, UsageStatus::Degraded);

        advance(300).await;
        assert_eq!(source.calls(), 5);

        advance(300).await;
        assert_eq!(source.calls(), 6);
        assert_eq!(h.store.status().await, UsageStatus::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_blocks_until_credentials_change() {
        let source = GatedSource::open(vec![Err(FetchError::Unauthorized)]);
        let h = spawn_loop(Settings::default(), source.clone());

        advance(600).await;
        assert_eq!(source.calls(), 1);
        assert!(matches!(
            h.store.status().await,
            UsageStatus::ReauthRequired { .. }
        ));

        h.events.send(LoopEvent::CredentialsChanged).unwrap();
        advance(1).await;
        assert_eq!(source.calls(), 2);
        assert_eq!(h.store.status().await, UsageStatus::Fresh);

        advance(60).await;
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_restored_fetches_only_without_data() {
        let source = GatedSource::open(vec![Err(FetchError::Decode("bad".into()))]);
        let h = spawn_loop(Settings::default(), source.clone());
        advance(1).await;
        assert!(!h.store.has_data().await);

        h.events.send(LoopEvent::NetworkLost).unwrap();
        advance(90).await;
        assert_eq!(source.calls(), 1);

        h.events.send(LoopEvent::NetworkRestored).unwrap();
        advance(1).await;
        assert_eq!(source.calls(), 2);
        assert!(h.store.has_data().await);

        h.events.send(LoopEvent::NetworkRestored).unwrap();
        advance(1).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_sleep_cancels_previous_wake_recovery() {
        let mut settings = Settings::default();
        settings.sleep.significant_sleep_secs = 0;
        settings.sleep.wake_retry_delays_secs = vec![2, 5, 10];

        let source = GatedSource::open(vec![
            Ok(60.0),
            Err(FetchError::Network("down".into())),
            Err(FetchError::Network("down".into())),
            Ok(60.0),
        ]);
        let h = spawn_loop(settings, source.clone());
        advance(1).await;
        assert_eq!(source.calls(), 1);

        h.events.send(LoopEvent::Suspend).unwrap();
        h.events.send(LoopEvent::Wake).unwrap();
        advance(3).await;
        assert_eq!(source.calls(), 2);

        // Second cycle before the first sequence's next attempt (due 5s later).
        h.events.send(LoopEvent::Suspend).unwrap();
        h.events.send(LoopEvent::Wake).unwrap();
        advance(3).await;
        assert_eq!(source.calls(), 3);

        advance(25).await;
        assert_eq!(source.calls(), 4);
        assert_eq!(h.store.status().await, UsageStatus::Fresh);

        advance(60).await;
        assert_eq!(source.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_sleep_resumes_without_recovery() {
        let source = GatedSource::open(vec![]);
        let h = spawn_loop(Settings::default(), source.clone());
        advance(1).await;

        h.events.send(LoopEvent::Suspend).unwrap();
        advance(100).await;
        assert_eq!(source.calls(), 1);

        h.events.send(LoopEvent::Wake).unwrap();
        advance(30).await;
        assert_eq!(source.calls(), 1);
        assert!(h.store.has_data().await);

        advance(31).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_sleep_keeps_user_pause() {
        let source = GatedSource::open(vec![]);
        let h = spawn_loop(Settings::default(), source.clone());
        advance(1).await;

        h.events.send(LoopEvent::Pause).unwrap();
        h.events.send(LoopEvent::Suspend).unwrap();
        advance(100).await;
        h.events.send(LoopEvent::Wake).unwrap();
        advance(600).await;
        assert_eq!(source.calls(), 1);

        h.events.send(LoopEvent::Resume).unwrap();
        advance(61).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_significant_sleep_keeps_user_pause() {
        let mut settings = Settings::default();
        settings.sleep.significant_sleep_secs = 0;
        settings.sleep.wake_retry_delays_secs = vec![2, 5, 10];

        let source = GatedSource::open(vec![]);
        let h = spawn_loop(settings, source.clone());
        advance(1).await;

        h.events.send(LoopEvent::Pause).unwrap();
        h.events.send(LoopEvent::Suspend).unwrap();
        h.events.send(LoopEvent::Wake).unwrap();
        advance(600).await;
        assert_eq!(source.calls(), 1);

        h.events.send(LoopEvent::Resume).unwrap();
        advance(61).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_during_sleep_survives_wake() {
        let source = GatedSource::open(vec![]);
        let h = spawn_loop(Settings::default(), source.clone());
        advance(1).await;

        h.events.send(LoopEvent::Suspend).unwrap();
        h.events.send(LoopEvent::Pause).unwrap();
        h.events.send(LoopEvent::Wake).unwrap();
        advance(600).await;
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_keeps_protocol_error_status() {
        let failures = (0..5)
            .map(|_| Err(FetchError::Decode("missing field `five_hour`".into())))
            .collect();
        let source = GatedSource::open(failures);
        let h = spawn_loop(Settings::default(), source.clone());

        advance(241).await;
        assert_eq!(source.calls(), 5);
        assert!(matches!(
            h.store.status().await,
            UsageStatus::Error { .. }
        ));

        advance(600).await;
        assert_eq!(source.calls(), 6);
        assert_eq!(h.store.status().await, UsageStatus::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_slows_polling_and_foreground_refreshes() {
        let source = GatedSource::open(vec![]);
        let h = spawn_loop(Settings::default(), source.clone());
        advance(1).await;

        h.events.send(LoopEvent::Background).unwrap();
        advance(800).await;
        assert_eq!(source.calls(), 1);

        h.events.send(LoopEvent::Foreground).unwrap();
        advance(1).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_crossing_notifies_once() {
        let source = GatedSource::open(vec![Ok(60.0), Ok(80.0), Ok(80.0)]);
        let h = spawn_loop(Settings::default(), source.clone());

        advance(200).await;
        assert!(source.calls() >= 3);

        let sent = h.sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "Claude usage reached 75%");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_loop() {
        let source = GatedSource::open(vec![]);
        let h = spawn_loop(Settings::default(), source.clone());
        advance(1).await;

        h.events.send(LoopEvent::Shutdown).unwrap();
        advance(600).await;
        assert_eq!(source.calls(), 1);
        assert!(h.events.send(LoopEvent::Refresh).is_err());
    }
}
