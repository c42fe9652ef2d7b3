use crate::core::error::CredentialError;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

const CREDENTIALS_PATH: &str = ".claude/.credentials.json";
const DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(200);

#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(access_token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

pub trait CredentialProvider: Send + Sync {
    fn get_token(&self) -> Result<AccessToken, CredentialError>;

    /// File whose changes mean the credentials may have been renewed.
    fn watch_path(&self) -> Option<PathBuf> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    #[serde(rename = "claudeAiOauth")]
    oauth: Option<OAuthCredentials>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OAuthCredentials {
    access_token: String,
    /// Milliseconds since the Unix epoch.
    expires_at: Option<i64>,
}

pub struct FileCredentialProvider {
    credentials_path: PathBuf,
}

impl FileCredentialProvider {
    pub fn new() -> Self {
        Self::with_path(
            dirs::home_dir()
                .map(|p| p.join(CREDENTIALS_PATH))
                .unwrap_or_else(|| PathBuf::from(CREDENTIALS_PATH)),
        )
    }

    pub fn with_path(credentials_path: impl Into<PathBuf>) -> Self {
        Self {
            credentials_path: credentials_path.into(),
        }
    }
}

impl Default for FileCredentialProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialProvider for FileCredentialProvider {
    fn get_token(&self) -> Result<AccessToken, CredentialError> {
        let content = match std::fs::read_to_string(&self.credentials_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialError::NotFound(self.credentials_path.clone()));
            }
            Err(e) => return Err(CredentialError::Invalid(e.to_string())),
        };

        let file: CredentialsFile = serde_json::from_str(&content)
            .map_err(|e| CredentialError::Invalid(e.to_string()))?;

        let oauth = file
            .oauth
            .ok_or_else(|| CredentialError::NotFound(self.credentials_path.clone()))?;

        if oauth.access_token.trim().is_empty() {
            return Err(CredentialError::Invalid("empty access token".to_string()));
        }

        let expires_at = oauth
            .expires_at
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        Ok(AccessToken::new(oauth.access_token, expires_at))
    }

    fn watch_path(&self) -> Option<PathBuf> {
        Some(self.credentials_path.clone())
    }
}

pub struct CredentialsWatcher {
    _watcher: RecommendedWatcher,
}

impl CredentialsWatcher {
    pub fn start(path: PathBuf) -> Result<(Self, mpsc::UnboundedReceiver<PathBuf>)> {
        let (async_tx, async_rx) = mpsc::unbounded_channel::<PathBuf>();

        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .context("Credentials path has no parent directory")?;
        let filename = path
            .file_name()
            .map(|f| f.to_os_string())
            .context("Credentials path has no file name")?;

        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<()>();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let Ok(event) = res else {
                    return;
                };
                if !(event.kind.is_modify() || event.kind.is_create()) {
                    return;
                }
                if event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(filename.as_os_str()))
                {
                    let _ = notify_tx.send(());
                }
            },
            Config::default(),
        )?;

        if parent.exists() {
            watcher
                .watch(&parent, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch directory: {}", parent.display()))?;
            tracing::info!(?parent, "Watching credentials directory");
        } else {
            tracing::warn!(
                ?parent,
                "Credentials directory does not exist, skipping watch"
            );
        }

        tokio::spawn(async move {
            while notify_rx.recv().await.is_some() {
                tokio::time::sleep(DEBOUNCE).await;
                while notify_rx.try_recv().is_ok() {}

                tracing::info!(?path, "Credentials file changed on disk");
                if async_tx.send(path.clone()).is_err() {
                    break;
                }
            }
        });

        Ok((Self { _watcher: watcher }, async_rx))
    }
}
