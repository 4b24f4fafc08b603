//! Boundary to the service that actually fetches track audio.

mod client;

pub use client::HttpDownloader;

use crate::library_store::{CanonicalEntity, EntityId, ExternalIds};
use crate::resilience::{Classify, ErrorClass};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::error::Elapsed;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Request to downloader failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Downloader answered {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Download timed out")]
    Timeout,

    #[error("Download rejected: {0}")]
    Rejected(String),
}

impl From<Elapsed> for DownloadError {
    fn from(_: Elapsed) -> Self {
        DownloadError::Timeout
    }
}

impl Classify for DownloadError {
    fn classify(&self) -> ErrorClass {
        match self {
            DownloadError::Request(e) if e.is_decode() || e.is_builder() => ErrorClass::Terminal,
            DownloadError::Request(_) | DownloadError::Timeout => ErrorClass::Transient,
            DownloadError::Status { status, .. } => {
                if *status == 429 || *status == 408 || *status >= 500 {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Terminal
                }
            }
            DownloadError::Rejected(_) => ErrorClass::Terminal,
        }
    }
}

/// What the downloader needs to know to find a track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadRequest {
    pub track_id: EntityId,
    pub title: String,
    pub album: Option<String>,
    pub artist: Option<String>,
    pub external_ids: ExternalIds,
}

impl DownloadRequest {
    /// Build a request for `track`, with album and artist names when known.
    pub fn for_track(
        track: &CanonicalEntity,
        album: Option<&CanonicalEntity>,
        artist: Option<&CanonicalEntity>,
    ) -> Self {
        Self {
            track_id: track.id,
            title: track.name.clone(),
            album: album.map(|a| a.name.clone()),
            artist: artist.map(|a| a.name.clone()),
            external_ids: track.external_ids.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DownloadReceipt {
    /// Where the downloader stored the file, if it says.
    #[serde(default)]
    pub location: Option<String>,
}

#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(&self, request: &DownloadRequest) -> Result<DownloadReceipt, DownloadError>;
}
