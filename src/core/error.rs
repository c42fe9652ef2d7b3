use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credentials found at {}", .0.display())]
    NotFound(PathBuf),

    #[error("credentials are unreadable: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Authentication,
    RateLimited,
    Server,
    Network,
    Protocol,
    Client,
    Exhausted,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::RateLimited | ErrorClass::Server | ErrorClass::Network
        )
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error("access token expired at {0}")]
    TokenExpired(DateTime<Utc>),

    #[error("unauthorized (HTTP 401)")]
    Unauthorized,

    #[error("rate limited (HTTP 429)")]
    RateLimited,

    #[error("server error (HTTP {status})")]
    Server { status: u16 },

    #[error("unexpected response (HTTP {status}): {body}")]
    Status { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("failed to decode usage response: {0}")]
    Decode(String),

    #[error("max retries exceeded after {attempts} attempts, last error: {last}")]
    MaxRetriesExceeded { attempts: u32, last: Box<FetchError> },
}

impl FetchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::Credentials(_) | FetchError::TokenExpired(_) | FetchError::Unauthorized => {
                ErrorClass::Authentication
            }
            FetchError::RateLimited => ErrorClass::RateLimited,
            FetchError::Server { .. } => ErrorClass::Server,
            FetchError::Network(_) => ErrorClass::Network,
            FetchError::Decode(_) => ErrorClass::Protocol,
            FetchError::Status { .. } => ErrorClass::Client,
            FetchError::MaxRetriesExceeded { .. } => ErrorClass::Exhausted,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Transient failures are the ones the pipeline itself retries, including
    /// an exhausted retry sequence whose last cause was one of them.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::MaxRetriesExceeded { last, .. } => last.is_transient(),
            other => other.is_retryable(),
        }
    }

    pub fn requires_reauth(&self) -> bool {
        self.class() == ErrorClass::Authentication
    }
}
