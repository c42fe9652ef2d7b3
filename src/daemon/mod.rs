mod app;
mod dbus;
mod polling;
mod scheduler;
mod signals;

use crate::core::settings::Settings;
use anyhow::Result;

pub const DBUS_NAME: &str = "io.github.ClaudeMeter";
pub const DBUS_PATH: &str = "/io/github/ClaudeMeter";

pub async fn run(settings: Settings) -> Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting claude-meter daemon");
    app::run(settings).await
}
