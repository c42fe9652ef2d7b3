use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api: ApiSettings,
    pub polling: PollingSettings,
    pub retry: RetrySettings,
    pub notifications: NotificationSettings,
    pub sleep: SleepSettings,
    pub cache: CacheSettings,
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub beta_header: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            beta_header: "oauth-2025-04-20".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub min_interval_secs: u64,
    pub default_interval_secs: u64,
    pub max_interval_secs: u64,
    pub background_interval_secs: u64,
    pub interval_hysteresis_secs: u64,
    pub moderate_usage_threshold: f64,
    pub high_usage_threshold: f64,
    pub critical_usage_threshold: f64,
    pub failure_ceiling: u32,
    pub failure_backoff_interval_secs: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            min_interval_secs: 30,
            default_interval_secs: 60,
            max_interval_secs: 300,
            background_interval_secs: 900,
            interval_hysteresis_secs: 10,
            moderate_usage_threshold: 50.0,
            high_usage_threshold: 75.0,
            critical_usage_threshold: 90.0,
            failure_ceiling: 5,
            failure_backoff_interval_secs: 600,
        }
    }
}

impl PollingSettings {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn default_interval(&self) -> Duration {
        Duration::from_secs(self.default_interval_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }

    pub fn background_interval(&self) -> Duration {
        Duration::from_secs(self.background_interval_secs)
    }

    pub fn interval_hysteresis(&self) -> Duration {
        Duration::from_secs(self.interval_hysteresis_secs)
    }

    pub fn failure_backoff_interval(&self) -> Duration {
        Duration::from_secs(self.failure_backoff_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_secs: u64,
    pub multiplier: f64,
    pub max_delay_secs: u64,
    pub server_error_min_delay_secs: u64,
    pub request_timeout_secs: u64,
    pub resource_timeout_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_secs: 2,
            multiplier: 2.0,
            max_delay_secs: 30,
            server_error_min_delay_secs: 30,
            request_timeout_secs: 30,
            resource_timeout_secs: 60,
        }
    }
}

impl RetrySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn resource_timeout(&self) -> Duration {
        Duration::from_secs(self.resource_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub thresholds: Vec<u32>,
    pub throttle_interval_secs: u64,
    pub hysteresis_buffer: f64,
    pub reset_drop_threshold: f64,
    pub reset_low_threshold: f64,
    pub credential_expiry_warning_secs: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            thresholds: vec![75, 90, 95],
            throttle_interval_secs: 3600,
            hysteresis_buffer: 5.0,
            reset_drop_threshold: 40.0,
            reset_low_threshold: 20.0,
            credential_expiry_warning_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SleepSettings {
    pub significant_sleep_secs: u64,
    pub wake_retry_delays_secs: Vec<u64>,
}

impl Default for SleepSettings {
    fn default() -> Self {
        Self {
            significant_sleep_secs: 300,
            wake_retry_delays_secs: vec![2, 5, 10],
        }
    }
}

impl SleepSettings {
    pub fn significant_sleep(&self) -> Duration {
        Duration::from_secs(self.significant_sleep_secs)
    }

    pub fn wake_retry_delays(&self) -> Vec<Duration> {
        self.wake_retry_delays_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_age_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { max_age_secs: 3600 }
    }
}

impl CacheSettings {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Settings {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("claude-meter").join("config.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path().context("Could not determine config directory")?;

        if !path.exists() {
            tracing::info!(?path, "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        settings
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        tracing::info!(?path, "Loaded config");
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.polling;
        if p.min_interval_secs == 0 {
            anyhow::bail!("polling.min_interval_secs must be greater than 0");
        }
        if p.min_interval_secs > p.default_interval_secs
            || p.default_interval_secs > p.max_interval_secs
        {
            anyhow::bail!(
                "polling intervals must satisfy min <= default <= max, got {} / {} / {}",
                p.min_interval_secs,
                p.default_interval_secs,
                p.max_interval_secs
            );
        }
        if !(p.moderate_usage_threshold <= p.high_usage_threshold
            && p.high_usage_threshold <= p.critical_usage_threshold)
        {
            anyhow::bail!("polling usage thresholds must be ascending (moderate <= high <= critical)");
        }
        if p.failure_ceiling == 0 {
            anyhow::bail!("polling.failure_ceiling must be at least 1");
        }

        let r = &self.retry;
        if r.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if r.multiplier < 1.0 {
            anyhow::bail!("retry.multiplier must be >= 1.0, got {}", r.multiplier);
        }

        let n = &self.notifications;
        if let Some(t) = n.thresholds.iter().find(|t| **t > 100) {
            anyhow::bail!("notifications.thresholds must be between 0 and 100, got {}", t);
        }
        if n.hysteresis_buffer < 0.0 {
            anyhow::bail!("notifications.hysteresis_buffer must not be negative");
        }

        if self.sleep.wake_retry_delays_secs.is_empty() {
            anyhow::bail!("sleep.wake_retry_delays_secs must not be empty");
        }

        Ok(())
    }
}
