use crate::core::cache::NotificationMemoryStore;
use crate::core::models::{UsageSnapshot, WindowKind};
use crate::core::settings::NotificationSettings;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotifiedKey {
    pub window: WindowKind,
    pub threshold: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Threshold(u32),
    Reset,
    CredentialExpiring,
}

impl NotificationKind {
    pub fn key(&self) -> String {
        match self {
            NotificationKind::Threshold(t) => format!("threshold-{t}"),
            NotificationKind::Reset => "reset".to_string(),
            NotificationKind::CredentialExpiring => "credential-expiring".to_string(),
        }
    }
}

/// Alert bookkeeping that must survive restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationMemory {
    #[serde(default)]
    pub notified_keys: BTreeSet<NotifiedKey>,
    #[serde(default)]
    pub last_sent_at: BTreeMap<String, DateTime<Utc>>,
}

impl NotificationMemory {
    #[cfg(test)]
    pub fn is_notified(&self, window: WindowKind, threshold: u32) -> bool {
        self.notified_keys.contains(&NotifiedKey { window, threshold })
    }

    fn clear_window(&mut self, window: WindowKind) {
        self.notified_keys.retain(|k| k.window != window);
    }
}

#[derive(Debug, Clone)]
pub struct ThresholdConfig {
    thresholds: Vec<u32>,
    hysteresis_buffer: f64,
    reset_drop_threshold: f64,
    reset_low_threshold: f64,
    throttle_interval: Duration,
}

impl ThresholdConfig {
    pub fn from_settings(settings: &NotificationSettings) -> Self {
        let mut thresholds = settings.thresholds.clone();
        thresholds.sort_unstable();
        thresholds.dedup();

        Self {
            thresholds,
            hysteresis_buffer: settings.hysteresis_buffer,
            reset_drop_threshold: settings.reset_drop_threshold,
            reset_low_threshold: settings.reset_low_threshold,
            throttle_interval: Duration::from_secs(settings.throttle_interval_secs),
        }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self::from_settings(&NotificationSettings::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Crossing {
    pub window: WindowKind,
    pub threshold: u32,
    pub utilization: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowReset {
    pub window: WindowKind,
    pub previous: f64,
    pub current: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub crossings: Vec<Crossing>,
    pub resets: Vec<WindowReset>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundNotification {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub dedupe_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct EvaluationOutcome {
    pub evaluation: Evaluation,
    pub notifications: Vec<OutboundNotification>,
    pub suppressed: Vec<NotificationKind>,
}

pub struct ThresholdEngine {
    config: ThresholdConfig,
    memory: NotificationMemory,
    store: Arc<dyn NotificationMemoryStore>,
}

impl ThresholdEngine {
    pub fn new(config: ThresholdConfig, store: Arc<dyn NotificationMemoryStore>) -> Self {
        let memory = match store.load() {
            Ok(memory) => memory,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load notification memory, starting empty");
                NotificationMemory::default()
            }
        };

        Self {
            config,
            memory,
            store,
        }
    }

    #[cfg(test)]
    pub fn memory(&self) -> &NotificationMemory {
        &self.memory
    }

    /// Compares `current` against the previous successful snapshot. The updated
    /// memory is persisted before it replaces the in-memory copy; if the write
    /// fails nothing changes and the error is returned.
    pub fn evaluate(
        &mut self,
        previous: Option<&UsageSnapshot>,
        current: &UsageSnapshot,
        now: DateTime<Utc>,
    ) -> Result<EvaluationOutcome> {
        let mut next = self.memory.clone();

        let evaluation = detect(&self.config, &mut next, previous, current);
        let mut outcome = EvaluationOutcome {
            evaluation,
            ..Default::default()
        };

        let planned = plan_notifications(&outcome.evaluation, current);
        for notification in planned {
            if throttle(&self.config, &mut next, notification.kind, now) {
                outcome.notifications.push(notification);
            } else {
                tracing::debug!(kind = %notification.kind.key(), "Notification throttled");
                outcome.suppressed.push(notification.kind);
            }
        }

        self.commit(next)?;
        Ok(outcome)
    }

    pub fn credential_expiring(
        &mut self,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
        warning: Duration,
    ) -> Result<Option<OutboundNotification>> {
        let remaining = expires_at.signed_duration_since(now);
        let Ok(remaining) = remaining.to_std() else {
            return Ok(None);
        };
        if remaining > warning {
            return Ok(None);
        }

        let kind = NotificationKind::CredentialExpiring;
        let mut next = self.memory.clone();
        if !throttle(&self.config, &mut next, kind, now) {
            return Ok(None);
        }
        self.commit(next)?;

        let minutes = (remaining.as_secs() / 60).max(1);
        Ok(Some(OutboundNotification {
            kind,
            title: "Claude credentials expiring soon".to_string(),
            body: format!(
                "Your access token expires in {minutes} minute{}. Sign in again with `claude` to keep usage updates flowing.",
                if minutes == 1 { "" } else { "s" }
            ),
            dedupe_id: dedupe_id(kind),
        }))
    }

    fn commit(&mut self, next: NotificationMemory) -> Result<()> {
        if next == self.memory {
            return Ok(());
        }
        self.store.save(&next)?;
        self.memory = next;
        Ok(())
    }
}

fn detect(
    config: &ThresholdConfig,
    memory: &mut NotificationMemory,
    previous: Option<&UsageSnapshot>,
    current: &UsageSnapshot,
) -> Evaluation {
    let mut evaluation = Evaluation::default();

    for (window, usage) in current.windows() {
        let now_pct = usage.utilization;
        let prev_pct = previous
            .and_then(|p| p.window(window))
            .map_or(0.0, |w| w.utilization);

        if prev_pct - now_pct > config.reset_drop_threshold && now_pct < config.reset_low_threshold
        {
            tracing::info!(
                window = window.key(),
                previous = prev_pct,
                current = now_pct,
                "Usage window reset detected"
            );
            memory.clear_window(window);
            evaluation.resets.push(WindowReset {
                window,
                previous: prev_pct,
                current: now_pct,
            });
        }

        for &threshold in &config.thresholds {
            let key = NotifiedKey { window, threshold };
            let t = f64::from(threshold);

            if now_pct >= t && prev_pct < t && !memory.notified_keys.contains(&key) {
                memory.notified_keys.insert(key);
                evaluation.crossings.push(Crossing {
                    window,
                    threshold,
                    utilization: now_pct,
                });
            } else if now_pct < t - config.hysteresis_buffer && memory.notified_keys.remove(&key) {
                tracing::debug!(window = window.key(), threshold, "Threshold re-armed");
            }
        }
    }

    evaluation
}

fn plan_notifications(evaluation: &Evaluation, current: &UsageSnapshot) -> Vec<OutboundNotification> {
    let mut planned = Vec::new();

    if let Some(highest) = evaluation.crossings.iter().map(|c| c.threshold).max() {
        let windows: BTreeSet<WindowKind> = evaluation.crossings.iter().map(|c| c.window).collect();
        let body = windows
            .iter()
            .filter_map(|w| current.window(*w).map(|u| (w, u)))
            .map(|(w, u)| format!("{} window at {:.0}%", w.label(), u.utilization))
            .collect::<Vec<_>>()
            .join("\n");

        let kind = NotificationKind::Threshold(highest);
        planned.push(OutboundNotification {
            kind,
            title: format!("Claude usage reached {highest}%"),
            body,
            dedupe_id: dedupe_id(kind),
        });
    }

    if !evaluation.resets.is_empty() {
        let body = evaluation
            .resets
            .iter()
            .map(|r| {
                format!(
                    "{} window reset ({:.0}% \u{2192} {:.0}%)",
                    r.window.label(),
                    r.previous,
                    r.current
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let kind = NotificationKind::Reset;
        planned.push(OutboundNotification {
            kind,
            title: "Claude usage limit reset".to_string(),
            body,
            dedupe_id: dedupe_id(kind),
        });
    }

    planned
}

/// Returns true and records the send time when `kind` may fire at `now`.
fn throttle(
    config: &ThresholdConfig,
    memory: &mut NotificationMemory,
    kind: NotificationKind,
    now: DateTime<Utc>,
) -> bool {
    let key = kind.key();
    if let Some(last) = memory.last_sent_at.get(&key) {
        let since = now.signed_duration_since(*last);
        if since.to_std().is_ok_and(|s| s < config.throttle_interval) {
            return false;
        }
    }
    memory.last_sent_at.insert(key, now);
    true
}

fn dedupe_id(kind: NotificationKind) -> String {
    format!("claude-meter-{}", kind.key())
}
