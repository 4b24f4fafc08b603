//! Runs the cleanup engine over the whole library.

use crate::background_jobs::context::JobContext;
use crate::background_jobs::job::{BackgroundJob, JobError, TaskResult};
use crate::cleanup::CleanupEngine;
use crate::library_store::{with_session, StoreError};
use crate::resilience::Classify;
use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

pub struct LibraryCleanupJob {
    engine: CleanupEngine,
}

impl LibraryCleanupJob {
    pub fn new(engine: CleanupEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl BackgroundJob for LibraryCleanupJob {
    async fn execute(&self, ctx: &JobContext) -> Result<TaskResult, JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let report = ctx
            .retry
            .run(
                || async {
                    with_session(ctx.store.as_ref(), |session| {
                        self.engine.run(session, Utc::now())
                    })
                },
                |e: &StoreError| e.is_transient(),
            )
            .await
            .map_err(|e| e.into_inner())?;

        info!(
            "Library cleanup completed: {} orphans repaired, {} failed and {} stale downloads reset, {} stray states cleared",
            report.orphans_repaired, report.failed_reset, report.stale_reset, report.stray_reset
        );

        Ok(TaskResult::ok()
            .with_stat("orphans_repaired", report.orphans_repaired as f64)
            .with_stat("failed_reset", report.failed_reset as f64)
            .with_stat("stale_reset", report.stale_reset as f64)
            .with_stat("stray_reset", report.stray_reset as f64))
    }
}
