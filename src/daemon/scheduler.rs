//! When to poll: the adaptive interval, the failure breaker, and the
//! single-flight guard. Nothing in here performs I/O; the polling loop drives
//! it and owns the actual timer.

use crate::core::settings::PollingSettings;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Paused,
    Background,
}

/// Step function from utilization to poll interval. Higher usage polls faster.
#[derive(Debug, Clone)]
pub struct IntervalPolicy {
    min: Duration,
    default: Duration,
    max: Duration,
    moderate_usage: f64,
    high_usage: f64,
    critical_usage: f64,
}

impl IntervalPolicy {
    pub fn from_settings(settings: &PollingSettings) -> Self {
        Self {
            min: settings.min_interval(),
            default: settings.default_interval(),
            max: settings.max_interval(),
            moderate_usage: settings.moderate_usage_threshold,
            high_usage: settings.high_usage_threshold,
            critical_usage: settings.critical_usage_threshold,
        }
    }

    pub fn interval_for(&self, usage: f64) -> Duration {
        if usage >= self.critical_usage {
            self.min
        } else if usage >= self.high_usage {
            (self.min + self.default) / 2
        } else if usage >= self.moderate_usage {
            self.default
        } else {
            self.default.mul_f64(1.5).min(self.max)
        }
    }

    pub fn default_interval(&self) -> Duration {
        self.default
    }
}

pub struct PollingScheduler {
    policy: IntervalPolicy,
    background_interval: Duration,
    hysteresis: Duration,
    failure_ceiling: u32,
    failure_backoff_interval: Duration,

    phase: Phase,
    resume_phase: Phase,
    current_interval: Duration,
    consecutive_failures: u32,
    in_failure_backoff: bool,
    last_observed_usage: Option<f64>,
    in_flight: bool,
    sleep_started_at: Option<DateTime<Utc>>,
    paused_by_suspend: bool,
    network_available: bool,
    next_tick_at: Option<Instant>,
}

impl PollingScheduler {
    pub fn new(settings: &PollingSettings) -> Self {
        let policy = IntervalPolicy::from_settings(settings);
        let current_interval = policy.default_interval();

        Self {
            policy,
            background_interval: settings.background_interval(),
            hysteresis: settings.interval_hysteresis(),
            failure_ceiling: settings.failure_ceiling.max(1),
            failure_backoff_interval: settings.failure_backoff_interval(),
            phase: Phase::Idle,
            resume_phase: Phase::Running,
            current_interval,
            consecutive_failures: 0,
            in_failure_backoff: false,
            last_observed_usage: None,
            in_flight: false,
            sleep_started_at: None,
            paused_by_suspend: false,
            network_available: true,
            next_tick_at: None,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn effective_interval(&self) -> Duration {
        match self.phase {
            Phase::Background => self.background_interval,
            _ => self.current_interval,
        }
    }

    #[cfg(test)]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn in_failure_backoff(&self) -> bool {
        self.in_failure_backoff
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn network_available(&self) -> bool {
        self.network_available
    }

    pub fn set_network_available(&mut self, available: bool) {
        self.network_available = available;
    }

    pub fn next_tick_at(&self) -> Option<Instant> {
        self.next_tick_at
    }

    fn timer_active(&self) -> bool {
        matches!(self.phase, Phase::Running | Phase::Background)
    }

    fn reschedule(&mut self, now: Instant) {
        self.next_tick_at = if self.timer_active() {
            Some(now + self.effective_interval())
        } else {
            None
        };
    }

    /// Arms the repeating timer. The caller fires the first tick itself.
    pub fn start(&mut self, now: Instant) {
        self.phase = Phase::Running;
        self.resume_phase = Phase::Running;
        self.reschedule(now);
        tracing::info!(
            interval_secs = self.current_interval.as_secs(),
            "Polling scheduler started"
        );
    }

    pub fn stop(&mut self) {
        self.phase = Phase::Idle;
        self.next_tick_at = None;
        tracing::info!("Polling scheduler stopped");
    }

    pub fn pause(&mut self) {
        if self.phase == Phase::Paused && self.paused_by_suspend {
            // Paused during a sleep: keep it paused once the machine wakes.
            self.paused_by_suspend = false;
            return;
        }
        if !self.timer_active() {
            return;
        }
        self.resume_phase = self.phase;
        self.phase = Phase::Paused;
        self.next_tick_at = None;
        tracing::debug!("Polling paused");
    }

    pub fn resume(&mut self, now: Instant) {
        self.phase = match self.phase {
            Phase::Paused => self.resume_phase,
            Phase::Background => Phase::Running,
            Phase::Idle | Phase::Running => return,
        };
        self.paused_by_suspend = false;
        self.reschedule(now);
        tracing::debug!(
            phase = ?self.phase,
            interval_secs = self.effective_interval().as_secs(),
            "Polling resumed"
        );
    }

    pub fn on_background(&mut self, now: Instant) {
        match self.phase {
            Phase::Running => {
                self.phase = Phase::Background;
                self.reschedule(now);
                tracing::debug!(
                    interval_secs = self.background_interval.as_secs(),
                    "Switched to background polling"
                );
            }
            Phase::Paused => self.resume_phase = Phase::Background,
            Phase::Idle | Phase::Background => {}
        }
    }

    /// Returns true when the caller should fire an immediate tick.
    pub fn on_foreground(&mut self, now: Instant) -> bool {
        match self.phase {
            Phase::Background => {
                self.phase = Phase::Running;
                self.reschedule(now);
                tracing::debug!(
                    interval_secs = self.current_interval.as_secs(),
                    "Switched to foreground polling"
                );
                true
            }
            Phase::Paused => {
                self.resume_phase = Phase::Running;
                false
            }
            Phase::Idle | Phase::Running => false,
        }
    }

    /// Returns true if the interval changed.
    pub fn update_for_usage(&mut self, usage: f64, now: Instant) -> bool {
        self.last_observed_usage = Some(usage);

        if self.phase != Phase::Running || self.in_failure_backoff {
            return false;
        }

        let target = self.policy.interval_for(usage);
        let diff = if target > self.current_interval {
            target - self.current_interval
        } else {
            self.current_interval - target
        };
        if diff <= self.hysteresis {
            return false;
        }

        tracing::info!(
            usage,
            old_secs = self.current_interval.as_secs(),
            new_secs = target.as_secs(),
            "Poll interval changed"
        );
        self.current_interval = target;
        self.reschedule(now);
        true
    }

    pub fn record_success(&mut self, now: Instant) {
        self.consecutive_failures = 0;

        if self.in_failure_backoff {
            self.in_failure_backoff = false;
            self.current_interval = self
                .last_observed_usage
                .map_or(self.policy.default_interval(), |u| self.policy.interval_for(u));
            tracing::info!(
                interval_secs = self.current_interval.as_secs(),
                "Recovered, leaving failure backoff"
            );
            if self.timer_active() {
                self.reschedule(now);
            }
        }
    }

    /// Returns true when this failure opened the breaker.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.in_failure_backoff || self.consecutive_failures < self.failure_ceiling {
            return false;
        }

        self.in_failure_backoff = true;
        self.current_interval = self.failure_backoff_interval;
        tracing::warn!(
            failures = self.consecutive_failures,
            interval_secs = self.current_interval.as_secs(),
            "Too many consecutive failures, backing off"
        );
        if self.timer_active() {
            self.reschedule(now);
        }
        true
    }

    /// Wall-clock time is used here because monotonic clocks stop while the
    /// machine is suspended.
    pub fn on_suspend(&mut self, now: DateTime<Utc>) {
        self.sleep_started_at = Some(now);
        if self.timer_active() {
            self.pause();
            self.paused_by_suspend = true;
        }
        tracing::info!(
            paused_by_suspend = self.paused_by_suspend,
            "System suspending, polling paused"
        );
    }

    /// True while the timer is stopped only because of a system sleep.
    pub fn paused_by_suspend(&self) -> bool {
        self.paused_by_suspend
    }

    /// Restarts the timer if the last suspend stopped it. A pause the user
    /// asked for stays in place.
    pub fn resume_after_sleep(&mut self, now: Instant) -> bool {
        if !self.paused_by_suspend {
            tracing::debug!(phase = ?self.phase, "Not resuming after sleep");
            return false;
        }
        self.resume(now);
        true
    }

    /// Reports how long the machine slept. Rescheduling is left to the caller.
    pub fn on_resume(&mut self, now: DateTime<Utc>) -> Option<Duration> {
        let started = self.sleep_started_at.take()?;
        let slept = now
            .signed_duration_since(started)
            .to_std()
            .unwrap_or(Duration::ZERO);
        tracing::info!(slept_secs = slept.as_secs(), "System resumed");
        Some(slept)
    }

    /// Single-flight guard. False means a fetch is already outstanding and the
    /// caller must drop its request.
    pub fn begin_fetch(&mut self) -> bool {
        if self.in_flight {
            return false;
        }
        self.in_flight = true;
        true
    }

    pub fn end_fetch(&mut self) {
        self.in_flight = false;
    }

    /// True when the timer fired; the next deadline is armed one interval out.
    pub fn poll_due(&mut self, now: Instant) -> bool {
        match self.next_tick_at {
            Some(at) if at <= now => {
                self.reschedule(now);
                true
            }
            _ => false,
        }
    }
}
