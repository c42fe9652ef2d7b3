use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    FiveHour,
    SevenDay,
    SevenDayOpus,
}

impl WindowKind {
    pub const ALL: [WindowKind; 3] = [
        WindowKind::FiveHour,
        WindowKind::SevenDay,
        WindowKind::SevenDayOpus,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            WindowKind::FiveHour => "five_hour",
            WindowKind::SevenDay => "seven_day",
            WindowKind::SevenDayOpus => "seven_day_opus",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            WindowKind::FiveHour => "5-hour",
            WindowKind::SevenDay => "7-day",
            WindowKind::SevenDayOpus => "7-day Opus",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageWindow {
    /// Percent of the window consumed, 0 to 100.
    pub utilization: f64,
    #[serde(default)]
    pub resets_at: Option<DateTime<Utc>>,
}

impl UsageWindow {
    pub fn remaining(&self) -> f64 {
        (100.0 - self.utilization).max(0.0)
    }
}

/// One successful read of the usage endpoint. A missing window means the
/// limit does not apply to the account, not that it is at zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    #[serde(default)]
    pub five_hour: Option<UsageWindow>,
    #[serde(default)]
    pub seven_day: Option<UsageWindow>,
    #[serde(default)]
    pub seven_day_opus: Option<UsageWindow>,
    pub fetched_at: DateTime<Utc>,
}

impl UsageSnapshot {
    pub fn window(&self, kind: WindowKind) -> Option<&UsageWindow> {
        match kind {
            WindowKind::FiveHour => self.five_hour.as_ref(),
            WindowKind::SevenDay => self.seven_day.as_ref(),
            WindowKind::SevenDayOpus => self.seven_day_opus.as_ref(),
        }
    }

    pub fn windows(&self) -> impl Iterator<Item = (WindowKind, &UsageWindow)> {
        WindowKind::ALL
            .into_iter()
            .filter_map(move |kind| self.window(kind).map(|w| (kind, w)))
    }

    pub fn max_utilization(&self) -> Option<f64> {
        self.windows()
            .map(|(_, w)| w.utilization)
            .fold(None, |acc, u| Some(acc.map_or(u, |a: f64| a.max(u))))
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.fetched_at)
    }
}

/// Body of `GET /api/oauth/usage`.
#[derive(Debug, Deserialize)]
pub struct UsageResponse {
    #[serde(default)]
    pub five_hour: Option<UsageWindow>,
    #[serde(default)]
    pub seven_day: Option<UsageWindow>,
    #[serde(default)]
    pub seven_day_opus: Option<UsageWindow>,
}

impl UsageResponse {
    pub fn into_snapshot(self, fetched_at: DateTime<Utc>) -> UsageSnapshot {
        let clamp = |w: Option<UsageWindow>| {
            w.map(|mut w| {
                w.utilization = w.utilization.clamp(0.0, 100.0);
                w
            })
        };

        UsageSnapshot {
            five_hour: clamp(self.five_hour),
            seven_day: clamp(self.seven_day),
            seven_day_opus: clamp(self.seven_day_opus),
            fetched_at,
        }
    }
}
