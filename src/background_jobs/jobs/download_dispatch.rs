//! Hands Pending tracks to the downloader service.
//!
//! An execution claims one batch of Pending tracks (moving them to
//! InProgress), fetches them with bounded concurrency behind the `downloader`
//! circuit breaker, then records each result. Tracks the breaker refused, or
//! that were not started because of shutdown, go back to Pending.

use crate::background_jobs::context::JobContext;
use crate::background_jobs::job::{BackgroundJob, JobError, TaskResult};
use crate::config::DownloaderSettings;
use crate::downloader::{DownloadError, DownloadReceipt, DownloadRequest, Downloader};
use crate::library_store::{
    in_session, DownloadState, EntityId, LibrarySession, StoreError, StoreResult,
};
use crate::resilience::{with_timeout, CircuitError, Classify};
use crate::server::metrics;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DOWNLOADER_DEPENDENCY: &str = "downloader";

pub struct DownloadDispatchJob {
    downloader: Arc<dyn Downloader>,
    settings: DownloaderSettings,
}

/// What happened to one claimed track.
enum FetchOutcome {
    Downloaded(DownloadReceipt),
    Failed(DownloadError),
    /// Not attempted: breaker open or shutting down.
    Deferred,
}

impl DownloadDispatchJob {
    pub fn new(downloader: Arc<dyn Downloader>, settings: DownloaderSettings) -> Self {
        Self {
            downloader,
            settings,
        }
    }

    /// Move up to `batch_size` owned Pending tracks to InProgress.
    fn claim(&self, session: &mut dyn LibrarySession) -> StoreResult<Vec<DownloadRequest>> {
        let now = Utc::now();
        let mut requests = Vec::new();
        for mut track in
            session.list_by_download_state(DownloadState::Pending, self.settings.batch_size)?
        {
            if !track.is_owned() || track.merged_into.is_some() {
                continue;
            }
            let album = match track.parent_id {
                Some(id) => session.get(id)?,
                None => None,
            };
            let artist = match album.as_ref().and_then(|a| a.parent_id) {
                Some(id) => session.get(id)?,
                None => None,
            };
            requests.push(DownloadRequest::for_track(&track, album.as_ref(), artist.as_ref()));

            track.set_download_state(DownloadState::InProgress, now);
            track.updated_at = now;
            session.update(&track)?;
        }
        Ok(requests)
    }

    async fn fetch(&self, ctx: &JobContext, request: &DownloadRequest) -> FetchOutcome {
        if ctx.is_cancelled() {
            return FetchOutcome::Deferred;
        }
        let breaker = ctx.breakers.get(DOWNLOADER_DEPENDENCY);
        let timeout = Duration::from_secs(self.settings.timeout_secs);
        let downloader = self.downloader.as_ref();

        match breaker
            .call_classified(|| with_timeout(timeout, downloader.fetch(request)))
            .await
        {
            Ok(receipt) => FetchOutcome::Downloaded(receipt),
            Err(CircuitError::Open { .. }) => FetchOutcome::Deferred,
            Err(CircuitError::Inner(e)) => FetchOutcome::Failed(e),
        }
    }

    /// Store the outcome, unless something else moved the track meanwhile.
    fn record(
        session: &mut dyn LibrarySession,
        track_id: EntityId,
        outcome: &FetchOutcome,
    ) -> StoreResult<bool> {
        let Some(mut track) = session.get(track_id)? else {
            return Ok(false);
        };
        if track.download_state != DownloadState::InProgress {
            return Ok(false);
        }

        let now = Utc::now();
        match outcome {
            FetchOutcome::Downloaded(receipt) => {
                track.set_download_state(DownloadState::Downloaded, now);
                track.attributes.remove("download_error");
                if let Some(location) = &receipt.location {
                    track
                        .attributes
                        .insert("download_location".to_string(), json!(location));
                }
            }
            FetchOutcome::Failed(e) => {
                track.set_download_state(DownloadState::Failed, now);
                track
                    .attributes
                    .insert("download_error".to_string(), json!(e.to_string()));
            }
            FetchOutcome::Deferred => track.set_download_state(DownloadState::Pending, now),
        }
        track.updated_at = now;
        session.update(&track)?;
        Ok(true)
    }
}

#[async_trait]
impl BackgroundJob for DownloadDispatchJob {
    async fn execute(&self, ctx: &JobContext) -> Result<TaskResult, JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let requests = ctx
            .retry
            .run(
                || async { in_session(ctx.store.as_ref(), |session| self.claim(session)) },
                |e: &StoreError| e.is_transient(),
            )
            .await
            .map_err(|e| e.into_inner())?;

        if requests.is_empty() {
            debug!("No tracks waiting for download");
            return Ok(TaskResult::ok().with_stat("claimed", 0u32));
        }
        info!("Dispatching {} tracks to the downloader", requests.len());

        let max_concurrent = self.settings.max_concurrent.max(1);
        let fetches: Vec<_> = requests
            .iter()
            .map(|request| async move { (request.track_id, self.fetch(ctx, request).await) })
            .collect();
        let results: Vec<(EntityId, FetchOutcome)> = stream::iter(fetches)
            .buffer_unordered(max_concurrent)
            .collect()
            .await;

        let (mut downloaded, mut failed, mut deferred) = (0usize, 0usize, 0usize);
        for (track_id, outcome) in &results {
            let label = match outcome {
                FetchOutcome::Downloaded(_) => {
                    downloaded += 1;
                    "downloaded"
                }
                FetchOutcome::Failed(e) => {
                    warn!("Download of track {} failed: {}", track_id, e);
                    failed += 1;
                    "failed"
                }
                FetchOutcome::Deferred => {
                    deferred += 1;
                    "deferred"
                }
            };
            metrics::record_download(label);

            ctx.retry
                .run(
                    || async {
                        in_session(ctx.store.as_ref(), |session| {
                            Self::record(session, *track_id, outcome)
                        })
                    },
                    |e: &StoreError| e.is_transient(),
                )
                .await
                .map_err(|e| e.into_inner())?;
        }

        info!(
            "Download dispatch completed: {} downloaded, {} failed, {} deferred",
            downloaded, failed, deferred
        );

        // Nothing got through: report the open circuit instead of a silent success
        if deferred == results.len() && !ctx.is_cancelled() {
            return Err(JobError::CircuitOpen {
                dependency: DOWNLOADER_DEPENDENCY.to_string(),
            });
        }

        Ok(TaskResult::ok()
            .with_stat("claimed", results.len() as f64)
            .with_stat("downloaded", downloaded as f64)
            .with_stat("failed", failed as f64)
            .with_stat("deferred", deferred as f64))
    }
}
