use crate::core::credentials::{CredentialProvider, FileCredentialProvider};
use crate::core::pipeline::FetchPipeline;
use crate::core::settings::Settings;
use crate::providers::ClaudeProvider;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;

pub async fn run(settings: &Settings) -> Result<()> {
    let provider = Arc::new(ClaudeProvider::new(settings)?);
    let pipeline = FetchPipeline::from_settings(provider, &settings.retry);
    let credentials = FileCredentialProvider::new();

    let token = match credentials.get_token() {
        Ok(token) => token,
        Err(e) => {
            eprintln!("Credentials unavailable: {e}");
            eprintln!("{}", pipeline.credential_error_hint());
            std::process::exit(1);
        }
    };

    if let Some(expires_at) = token.expires_at {
        let remaining = expires_at.signed_duration_since(Utc::now());
        if remaining.num_seconds() > 0 {
            println!("Token expires in {} minutes", remaining.num_minutes());
        }
    }

    if pipeline.validate_token(&token).await {
        println!("Credentials are valid");
        Ok(())
    } else {
        eprintln!("Credentials were rejected");
        eprintln!("{}", pipeline.credential_error_hint());
        std::process::exit(1);
    }
}
