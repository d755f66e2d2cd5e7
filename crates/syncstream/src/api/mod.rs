//! Thin client for the sync API calls that sit next to streaming.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use thiserror::Error;

use crate::config::StreamConfig;
use crate::stream::{CredentialProvider, ORGANIZATION_HEADER};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("No credentials available for API request")]
    MissingCredentials,
}

impl ApiError {
    pub fn is_auth_failure(&self) -> bool {
        match self {
            ApiError::Status { status, .. } => matches!(status, 401 | 403),
            ApiError::MissingCredentials => true,
            ApiError::Http(_) => false,
        }
    }
}

/// Starts sync runs. Returns the id of the stream to subscribe to.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    async fn start_run(&self, key: &str) -> Result<String, ApiError>;
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    id: String,
}

/// reqwest-backed [`JobLauncher`] posting to the configured run path.
pub struct SyncApiClient {
    client: Client,
    config: StreamConfig,
    credentials: Arc<dyn CredentialProvider>,
}

impl SyncApiClient {
    pub fn new(config: StreamConfig, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self::with_client(Client::new(), config, credentials)
    }

    pub fn with_client(
        client: Client,
        config: StreamConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            client,
            config,
            credentials,
        }
    }
}

#[async_trait]
impl JobLauncher for SyncApiClient {
    async fn start_run(&self, key: &str) -> Result<String, ApiError> {
        let credentials = self
            .credentials
            .credentials()
            .ok_or(ApiError::MissingCredentials)?;

        let mut request = self
            .client
            .post(self.config.run_url(key))
            .bearer_auth(credentials.token.expose_secret());
        if let Some(org) = &credentials.organization_id {
            request = request.header(ORGANIZATION_HEADER, org);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = ApiError::Status {
                status: status.as_u16(),
                body,
            };
            if err.is_auth_failure() {
                self.credentials.invalidate();
            }
            return Err(err);
        }

        let run: RunResponse = response.json().await?;
        tracing::debug!(key, run_id = %run.id, "sync run requested");
        Ok(run.id)
    }
}
