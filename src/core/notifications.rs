use anyhow::{Context, Result};
use notify_rust::Notification;
use std::collections::HashMap;
use std::sync::Mutex;

pub trait NotificationSink: Send + Sync {
    fn send(&self, title: &str, body: &str, dedupe_id: &str) -> Result<()>;
}

/// Desktop notifications over the freedesktop notification service. A repeated
/// `dedupe_id` replaces the notification it sent last time.
#[derive(Default)]
pub struct DesktopNotificationSink {
    shown: Mutex<HashMap<String, u32>>,
}

impl DesktopNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NotificationSink for DesktopNotificationSink {
    fn send(&self, title: &str, body: &str, dedupe_id: &str) -> Result<()> {
        let mut shown = self
            .shown
            .lock()
            .map_err(|_| anyhow::anyhow!("notification map poisoned"))?;

        let mut notification = Notification::new();
        notification
            .summary(title)
            .body(body)
            .appname("claude-meter")
            .timeout(notify_rust::Timeout::Milliseconds(5000));
        if let Some(id) = shown.get(dedupe_id) {
            notification.id(*id);
        }

        let handle = notification
            .show()
            .context("Failed to show desktop notification")?;
        shown.insert(dedupe_id.to_string(), handle.id());

        tracing::info!(dedupe_id, title, "Sent notification");
        Ok(())
    }
}
