//! Folds fuzzy duplicates together, or queues them for a human.
//!
//! Candidates scoring at least the auto-merge threshold are merged right
//! away, the survivor picked by [`pick_survivor`]. Candidates between the
//! review and auto-merge thresholds go to the manual review queue. Each merge
//! is its own transaction.

use crate::background_jobs::context::JobContext;
use crate::background_jobs::job::{BackgroundJob, JobError, TaskResult};
use crate::config::ReconcilerSettings;
use crate::library_store::{in_session, DuplicateCandidate, EntityId, EntityKind, StoreError};
use crate::reconciler::{find_candidates, pick_survivor, EntityReconciler, ReconcileError};
use crate::resilience::Classify;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use tracing::{debug, info, warn};

pub struct DuplicateMergeJob {
    reconciler: EntityReconciler,
    settings: ReconcilerSettings,
}

#[derive(Debug, Default)]
struct MergeStats {
    candidates: usize,
    merged: usize,
    queued: usize,
    skipped: usize,
}

impl DuplicateMergeJob {
    pub fn new(reconciler: EntityReconciler, settings: ReconcilerSettings) -> Self {
        Self {
            reconciler,
            settings,
        }
    }

    async fn merge(
        &self,
        ctx: &JobContext,
        candidate: &DuplicateCandidate,
    ) -> Result<(EntityId, EntityId), ReconcileError> {
        ctx.retry
            .run(
                || async {
                    in_session(ctx.store.as_ref(), |session| {
                        let left = session
                            .get(candidate.left)?
                            .ok_or(StoreError::NotFound(candidate.left))?;
                        let right = session
                            .get(candidate.right)?
                            .ok_or(StoreError::NotFound(candidate.right))?;
                        let (keep, remove) = pick_survivor(&left, &right);
                        self.reconciler
                            .merge_duplicates(session, keep, remove, Utc::now())?;
                        Ok((keep, remove))
                    })
                },
                |e: &ReconcileError| e.is_transient(),
            )
            .await
            .map_err(|e| e.into_inner())
    }

    async fn process_kind(
        &self,
        ctx: &JobContext,
        kind: EntityKind,
        stats: &mut MergeStats,
    ) -> Result<(), JobError> {
        let candidates = {
            let session = ctx.store.begin()?;
            find_candidates(session.as_ref(), kind, self.settings.review_threshold)?
        };
        stats.candidates += candidates.len();
        debug!("Found {} {} duplicate candidates", candidates.len(), kind);

        let mut merged_away: HashSet<EntityId> = HashSet::new();
        for candidate in candidates {
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            if merged_away.contains(&candidate.left) || merged_away.contains(&candidate.right) {
                stats.skipped += 1;
                continue;
            }

            if candidate.score >= self.settings.auto_merge_threshold {
                match self.merge(ctx, &candidate).await {
                    Ok((keep, remove)) => {
                        info!(
                            "Merged {} {} into {} (similarity {:.3})",
                            kind, remove, keep, candidate.score
                        );
                        merged_away.insert(remove);
                        stats.merged += 1;
                    }
                    Err(e) if !e.is_transient() => {
                        warn!(
                            "Skipping {} pair {}/{}: {}",
                            kind, candidate.left, candidate.right, e
                        );
                        stats.skipped += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            } else {
                let queued = ctx
                    .retry
                    .run(
                        || async {
                            in_session(ctx.store.as_ref(), |session| {
                                session.enqueue_review(&candidate)
                            })
                        },
                        |e: &StoreError| e.is_transient(),
                    )
                    .await
                    .map_err(|e| e.into_inner())?;
                if queued {
                    debug!(
                        "Queued {} pair {}/{} for review (similarity {:.3})",
                        kind, candidate.left, candidate.right, candidate.score
                    );
                    stats.queued += 1;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BackgroundJob for DuplicateMergeJob {
    async fn execute(&self, ctx: &JobContext) -> Result<TaskResult, JobError> {
        let mut stats = MergeStats::default();

        // Parents first: merging albums re-parents their tracks, which can put
        // duplicate tracks in the same bucket.
        for kind in [EntityKind::Artist, EntityKind::Album, EntityKind::Track] {
            self.process_kind(ctx, kind, &mut stats).await?;
        }

        info!(
            "Duplicate merge completed: {} candidates, {} merged, {} queued for review, {} skipped",
            stats.candidates, stats.merged, stats.queued, stats.skipped
        );

        Ok(TaskResult::ok()
            .with_stat("candidates", stats.candidates as f64)
            .with_stat("merged", stats.merged as f64)
            .with_stat("queued", stats.queued as f64)
            .with_stat("skipped", stats.skipped as f64))
    }
}
