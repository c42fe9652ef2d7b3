use crate::core::error::ErrorClass;
use crate::core::settings::RetrySettings;
use std::time::Duration;

const MAX_EXPONENT: u32 = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    server_error_min_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
        server_error_min_delay: Duration,
    ) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay,
            server_error_min_delay,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            Duration::from_secs(settings.initial_delay_secs),
            settings.multiplier,
            Duration::from_secs(settings.max_delay_secs),
            Duration::from_secs(settings.server_error_min_delay_secs),
        )
    }

    /// `min(initial * multiplier^attempt, max)`, attempt counted from 0.
    pub fn exponential_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(MAX_EXPONENT) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Wait before the next attempt, or `None` when the class is not retried.
    pub fn delay_for(&self, attempt: u32, class: ErrorClass) -> Option<Duration> {
        match class {
            ErrorClass::RateLimited | ErrorClass::Network => Some(self.exponential_delay(attempt)),
            ErrorClass::Server => Some(
                self.exponential_delay(attempt)
                    .max(self.server_error_min_delay),
            ),
            ErrorClass::Authentication
            | ErrorClass::Protocol
            | ErrorClass::Client
            | ErrorClass::Exhausted => None,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}
