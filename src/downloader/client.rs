//! HTTP client for the external downloader service.

use super::{DownloadError, DownloadReceipt, DownloadRequest, Downloader};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Posts download requests to `{base_url}/v1/download`.
pub struct HttpDownloader {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
}

impl HttpDownloader {
    /// # Arguments
    /// * `base_url` - Base URL of the downloader service (e.g., "http://localhost:3002")
    /// * `timeout` - Request timeout
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        // Ensure base_url doesn't have trailing slash
        let base_url = base_url.trim_end_matches('/').to_string();

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(&self, request: &DownloadRequest) -> Result<DownloadReceipt, DownloadError> {
        let url = format!("{}/v1/download", self.base_url);
        debug!("Requesting download of track {} from {}", request.track_id, url);

        let response = self.client.post(&url).json(request).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.error)
            .unwrap_or(body);

        if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            return Err(DownloadError::Rejected(message));
        }
        Err(DownloadError::Status {
            status: status.as_u16(),
            message,
        })
    }
}
