use crate::core::credentials::AccessToken;
use crate::core::error::FetchError;
use crate::core::models::{UsageResponse, UsageSnapshot};
use crate::core::settings::Settings;
use crate::providers::UsageProvider;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;

const USAGE_PATH: &str = "/api/oauth/usage";
const USER_AGENT: &str = concat!("claude-meter/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY: usize = 512;

pub struct ClaudeProvider {
    client: reqwest::Client,
    endpoint: String,
    beta_header: String,
}

impl ClaudeProvider {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .read_timeout(settings.retry.request_timeout())
            .timeout(settings.retry.resource_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}{}",
                settings.api.base_url.trim_end_matches('/'),
                USAGE_PATH
            ),
            beta_header: settings.api.beta_header.clone(),
        })
    }
}

#[async_trait]
impl UsageProvider for ClaudeProvider {
    fn name(&self) -> &'static str {
        "Claude"
    }

    async fn fetch_usage(&self, token: &AccessToken) -> Result<UsageSnapshot, FetchError> {
        let response = self
            .client
            .get(&self.endpoint)
            .bearer_auth(&token.access_token)
            .header("anthropic-beta", &self.beta_header)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body = response.text().await.map_err(transport_error)?;
        decode_usage(&body)
    }

    fn credential_error_hint(&self) -> &'static str {
        "Run `claude` to sign in again"
    }
}

fn transport_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Network(format!("request timed out: {err}"))
    } else if err.is_decode() {
        FetchError::Decode(err.to_string())
    } else {
        FetchError::Network(err.to_string())
    }
}

pub(crate) fn classify_status(status: StatusCode, body: &str) -> FetchError {
    match status.as_u16() {
        401 => FetchError::Unauthorized,
        429 => FetchError::RateLimited,
        code if code >= 500 => FetchError::Server { status: code },
        code => FetchError::Status {
            status: code,
            body: body.chars().take(MAX_ERROR_BODY).collect(),
        },
    }
}

pub(crate) fn decode_usage(body: &str) -> Result<UsageSnapshot, FetchError> {
    let response: UsageResponse =
        serde_json::from_str(body).map_err(|e| FetchError::Decode(e.to_string()))?;
    Ok(response.into_snapshot(Utc::now()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorClass;
    use tokio::net::TcpListener;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            FetchError::Unauthorized
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            FetchError::RateLimited
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            FetchError::Server { status: 502 }
        ));
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, "nope").class(),
            ErrorClass::Client
        );
    }

    #[test]
    fn test_error_body_is_truncated() {
        let body = "x".repeat(4096);
        match classify_status(StatusCode::NOT_FOUND, &body) {
            FetchError::Status { status, body } => {
                assert_eq!(status, 404);
                assert_eq!(body.len(), MAX_ERROR_BODY);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_decode_usage() {
        let snapshot = decode_usage(
            r#"{"five_hour": {"utilization": 91.0, "resets_at": "2026-01-18T15:30:00Z"}, "seven_day": null}"#,
        )
        .unwrap();
        assert!((snapshot.five_hour.unwrap().utilization - 91.0).abs() < f64::EPSILON);
        assert!(snapshot.seven_day.is_none());
    }

    #[test]
    fn test_decode_malformed_body_is_protocol_error() {
        let err = decode_usage("<html>maintenance</html>").unwrap_err();
        assert_eq!(err.class(), ErrorClass::Protocol);
        assert!(!err.is_retryable());
    }

    fn local_settings(addr: std::net::SocketAddr) -> Settings {
        let mut settings = Settings::default();
        settings.api.base_url = format!("http://{addr}");
        settings.retry.request_timeout_secs = 1;
        settings.retry.resource_timeout_secs = 2;
        settings
    }

    fn token() -> AccessToken {
        AccessToken::new("test-token", None)
    }

    /// Answers every request with `status` and an empty body.
    async fn serve_status(status: &'static str) -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out_as_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let provider = ClaudeProvider::new(&local_settings(addr)).unwrap();
        let started = std::time::Instant::now();
        let err = provider.fetch_usage(&token()).await.unwrap_err();

        assert!(matches!(err, FetchError::Network(_)), "got {err:?}");
        assert_eq!(err.class(), ErrorClass::Network);
        assert!(err.is_retryable());
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_http_status_mapping_over_client() {
        let provider =
            ClaudeProvider::new(&local_settings(serve_status("429 Too Many Requests").await))
                .unwrap();
        let err = provider.fetch_usage(&token()).await.unwrap_err();
        assert!(matches!(err, FetchError::RateLimited), "got {err:?}");
        assert_eq!(err.class(), ErrorClass::RateLimited);

        let provider =
            ClaudeProvider::new(&local_settings(serve_status("503 Service Unavailable").await))
                .unwrap();
        let err = provider.fetch_usage(&token()).await.unwrap_err();
        assert!(matches!(err, FetchError::Server { status: 503 }), "got {err:?}");
        assert_eq!(err.class(), ErrorClass::Server);
    }

    #[tokio::test]
    async fn test_refused_connection_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = ClaudeProvider::new(&local_settings(addr)).unwrap();
        let err = provider.fetch_usage(&token()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Network);
    }

    #[test]
    fn test_endpoint_from_settings() {
        let mut settings = Settings::default();
        settings.api.base_url = "http://localhost:8080/".to_string();
        let provider = ClaudeProvider::new(&settings).unwrap();
        assert_eq!(provider.endpoint, "http://localhost:8080/api/oauth/usage");
    }
}
