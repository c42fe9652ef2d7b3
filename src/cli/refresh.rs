use crate::daemon::{DBUS_NAME, DBUS_PATH};
use anyhow::{Context, Result};

pub async fn run() -> Result<()> {
    call_daemon("Refresh").await?;
    println!("Refresh triggered successfully");
    Ok(())
}

async fn call_daemon(method: &str) -> Result<()> {
    let connection = zbus::Connection::session()
        .await
        .context("Failed to connect to session D-Bus")?;

    let _reply: () = connection
        .call_method(Some(DBUS_NAME), DBUS_PATH, Some(DBUS_NAME), method, &())
        .await
        .with_context(|| format!("Failed to call {method} - is the daemon running?"))?
        .body()
        .deserialize()
        .context("Failed to deserialize response")?;

    tracing::debug!(method, "Daemon call succeeded");
    Ok(())
}
