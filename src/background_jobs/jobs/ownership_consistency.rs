//! Keeps parent ownership in line with the ownership of their children.

use crate::background_jobs::context::JobContext;
use crate::background_jobs::job::{BackgroundJob, JobError, TaskResult};
use crate::library_store::{with_session, StoreError};
use crate::ownership::OwnershipEngine;
use crate::resilience::Classify;
use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

pub struct OwnershipConsistencyJob {
    engine: OwnershipEngine,
}

impl OwnershipConsistencyJob {
    pub fn new(engine: OwnershipEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl BackgroundJob for OwnershipConsistencyJob {
    async fn execute(&self, ctx: &JobContext) -> Result<TaskResult, JobError> {
        let report = ctx
            .retry
            .run(
                || async {
                    with_session(ctx.store.as_ref(), |session| {
                        self.engine.consistency_pass(session, Utc::now())
                    })
                },
                |e: &StoreError| e.is_transient(),
            )
            .await
            .map_err(|e| e.into_inner())?;

        info!(
            "Ownership consistency completed: {} parents promoted, {} demoted",
            report.promoted, report.demoted
        );

        Ok(TaskResult::ok()
            .with_stat("promoted", report.promoted as f64)
            .with_stat("demoted", report.demoted as f64))
    }
}
