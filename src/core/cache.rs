use crate::core::models::UsageSnapshot;
use crate::core::thresholds::NotificationMemory;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "claude-meter";

pub trait SnapshotCache: Send + Sync {
    fn store(&self, snapshot: &UsageSnapshot) -> Result<()>;
    fn load_last_known(&self, max_age: Option<Duration>) -> Result<Option<UsageSnapshot>>;
}

pub trait NotificationMemoryStore: Send + Sync {
    fn load(&self) -> Result<NotificationMemory>;
    fn save(&self, memory: &NotificationMemory) -> Result<()>;
}

fn within_max_age(snapshot: &UsageSnapshot, max_age: Option<Duration>) -> bool {
    let Some(max_age) = max_age else {
        return true;
    };
    match snapshot.age(Utc::now()).to_std() {
        Ok(age) => age <= max_age,
        // fetched_at in the future: clock moved backwards, treat as fresh
        Err(_) => true,
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };

    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Writes to a sibling temp file then renames over the target, so readers see
/// either the old or the new contents.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

pub struct FileSnapshotCache {
    path: PathBuf,
}

impl FileSnapshotCache {
    pub fn new() -> Result<Self> {
        let dir = dirs::cache_dir().context("Could not determine cache directory")?;
        Ok(Self::with_path(dir.join(APP_DIR).join("usage.json")))
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotCache for FileSnapshotCache {
    fn store(&self, snapshot: &UsageSnapshot) -> Result<()> {
        write_json_atomic(&self.path, snapshot)
    }

    fn load_last_known(&self, max_age: Option<Duration>) -> Result<Option<UsageSnapshot>> {
        let snapshot: Option<UsageSnapshot> = read_json(&self.path)?;
        Ok(snapshot.filter(|s| within_max_age(s, max_age)))
    }
}

pub struct FileMemoryStore {
    path: PathBuf,
}

impl FileMemoryStore {
    pub fn new() -> Result<Self> {
        let dir = dirs::data_dir().context("Could not determine data directory")?;
        Ok(Self::with_path(dir.join(APP_DIR).join("notifications.json")))
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl NotificationMemoryStore for FileMemoryStore {
    fn load(&self) -> Result<NotificationMemory> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    fn save(&self, memory: &NotificationMemory) -> Result<()> {
        write_json_atomic(&self.path, memory)
    }
}
