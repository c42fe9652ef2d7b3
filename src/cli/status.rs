use crate::core::credentials::{CredentialProvider, FileCredentialProvider};
use crate::core::models::{UsageSnapshot, UsageWindow, WindowKind};
use crate::core::pipeline::FetchPipeline;
use crate::core::settings::Settings;
use crate::providers::ClaudeProvider;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Serialize)]
struct StatusOutput {
    windows: BTreeMap<&'static str, WindowStatus>,
    #[serde(with = "chrono::serde::ts_seconds")]
    fetched_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct WindowStatus {
    used_percent: f64,
    remaining_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    resets_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resets_in: Option<String>,
}

pub async fn run(settings: &Settings, json: bool) -> Result<()> {
    let provider = Arc::new(ClaudeProvider::new(settings)?);
    let pipeline = FetchPipeline::from_settings(provider, &settings.retry);

    let token = FileCredentialProvider::new()
        .get_token()
        .with_context(|| pipeline.credential_error_hint())?;

    let snapshot = pipeline
        .fetch_with_retry(&token)
        .await
        .context("Failed to fetch usage")?;

    let now = Utc::now();
    if json {
        println!("{}", serde_json::to_string_pretty(&to_output(&snapshot, now))?);
    } else {
        print_text_output(&snapshot, now);
    }

    Ok(())
}

fn to_output(snapshot: &UsageSnapshot, now: DateTime<Utc>) -> StatusOutput {
    StatusOutput {
        windows: snapshot
            .windows()
            .map(|(kind, window)| (kind.key(), window_to_status(window, now)))
            .collect(),
        fetched_at: snapshot.fetched_at,
    }
}

fn window_to_status(window: &UsageWindow, now: DateTime<Utc>) -> WindowStatus {
    WindowStatus {
        used_percent: window.utilization,
        remaining_percent: window.remaining(),
        resets_at: window.resets_at,
        resets_in: window.resets_at.map(|at| format_reset_time(at, now)),
    }
}

fn format_reset_time(resets_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let duration = resets_at.signed_duration_since(now);

    if duration.num_seconds() <= 0 {
        return "now".to_string();
    }

    let total_minutes = duration.num_minutes();
    let days = total_minutes / (24 * 60);
    let hours = (total_minutes % (24 * 60)) / 60;
    let minutes = total_minutes % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

fn print_text_output(snapshot: &UsageSnapshot, now: DateTime<Utc>) {
    println!("Claude usage");

    let mut any = false;
    for kind in WindowKind::ALL {
        if let Some(window) = snapshot.window(kind) {
            print_window_line(kind.label(), &window_to_status(window, now));
            any = true;
        }
    }
    if !any {
        println!("  No usage windows reported");
    }
}

fn print_window_line(label: &str, window: &WindowStatus) {
    let reset_info = window
        .resets_in
        .as_ref()
        .map(|r| format!(" (resets in {})", r))
        .unwrap_or_default();

    println!(
        "  {:<12} {:>5.1}% used{}",
        format!("{}:", label),
        window.used_percent,
        reset_info
    );
}
