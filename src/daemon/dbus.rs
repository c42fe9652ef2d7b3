use crate::core::models::UsageSnapshot;
use crate::core::store::{UsageStatus, UsageStore};
use crate::daemon::polling::LoopEvent;
use crate::daemon::{DBUS_NAME, DBUS_PATH};
use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use zbus::interface;

#[derive(Debug, Serialize)]
struct UsageView {
    status: UsageStatus,
    snapshot: Option<UsageSnapshot>,
}

/// Session-bus surface. Commands are forwarded to the loop; `Usage` reads the
/// store directly.
pub struct ClaudeMeterService {
    events: mpsc::UnboundedSender<LoopEvent>,
    store: UsageStore,
}

impl ClaudeMeterService {
    pub fn new(events: mpsc::UnboundedSender<LoopEvent>, store: UsageStore) -> Self {
        Self { events, store }
    }

    async fn usage_json(&self) -> serde_json::Result<String> {
        let view = UsageView {
            status: self.store.status().await,
            snapshot: self.store.get_snapshot().await,
        };
        serde_json::to_string(&view)
    }

    fn forward(&self, event: LoopEvent) -> zbus::fdo::Result<()> {
        tracing::info!(?event, "D-Bus command received");
        self.events
            .send(event)
            .map_err(|_| zbus::fdo::Error::Failed("polling loop is not running".to_string()))
    }
}

#[interface(name = "io.github.ClaudeMeter")]
impl ClaudeMeterService {
    async fn refresh(&self) -> zbus::fdo::Result<()> {
        self.forward(LoopEvent::Refresh)
    }

    async fn foreground(&self) -> zbus::fdo::Result<()> {
        self.forward(LoopEvent::Foreground)
    }

    async fn background(&self) -> zbus::fdo::Result<()> {
        self.forward(LoopEvent::Background)
    }

    async fn pause(&self) -> zbus::fdo::Result<()> {
        self.forward(LoopEvent::Pause)
    }

    async fn resume(&self) -> zbus::fdo::Result<()> {
        self.forward(LoopEvent::Resume)
    }

    /// Display snapshot and status as JSON, for shells that render them.
    async fn usage(&self) -> zbus::fdo::Result<String> {
        self.usage_json()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("failed to encode usage: {e}")))
    }
}

pub async fn start_dbus_server(
    events: mpsc::UnboundedSender<LoopEvent>,
    store: UsageStore,
) -> Result<zbus::Connection> {
    let connection = zbus::connection::Builder::session()?
        .name(DBUS_NAME)?
        .serve_at(DBUS_PATH, ClaudeMeterService::new(events, store))?
        .build()
        .await
        .context("Failed to register D-Bus service")?;

    tracing::info!(name = DBUS_NAME, path = DBUS_PATH, "D-Bus service registered");
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::testing::snapshot_at;

    #[test]
    fn test_forward_sends_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let service = ClaudeMeterService::new(tx, UsageStore::new());

        service.forward(LoopEvent::Pause).unwrap();
        assert_eq!(rx.try_recv().unwrap(), LoopEvent::Pause);
    }

    #[test]
    fn test_forward_fails_when_loop_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let service = ClaudeMeterService::new(tx, UsageStore::new());

        assert!(service.forward(LoopEvent::Refresh).is_err());
    }

    #[tokio::test]
    async fn test_usage_reports_status_and_snapshot() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let store = UsageStore::new();
        let service = ClaudeMeterService::new(tx, store.clone());

        let json: serde_json::Value =
            serde_json::from_str(&service.usage_json().await.unwrap()).unwrap();
        assert_eq!(json["status"]["state"], "loading");
        assert!(json["snapshot"].is_null());

        store.record_fetch(snapshot_at(42.0)).await;
        let json: serde_json::Value =
            serde_json::from_str(&service.usage_json().await.unwrap()).unwrap();
        assert_eq!(json["status"]["state"], "fresh");
        assert_eq!(json["snapshot"]["five_hour"]["utilization"], 42.0);
    }
}
