//! Pulls new and changed records from one import source into the library.
//!
//! One task is registered per source, named `sync_<source>`. The listing is
//! the only call that leaves the process; it goes through the source's
//! circuit breaker, the context retry policy and the call timeout. Every
//! record is then reconciled in its own short transaction so that a bad
//! record only costs itself.

use crate::background_jobs::context::JobContext;
use crate::background_jobs::job::{BackgroundJob, JobError, TaskResult};
use crate::import_source::{ImportSource, RawRecord, SourceError};
use crate::library_store::{in_session, EntityKind};
use crate::ownership::OwnershipTransition;
use crate::reconciler::{EntityReconciler, ReconcileAction, ReconcileError, ReconcileOutcome};
use crate::resilience::{with_timeout, CircuitError, Classify};
use crate::server::metrics;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::DOWNLOAD_DISPATCH_TASK;

pub struct LibrarySyncJob {
    source: Arc<dyn ImportSource>,
    reconciler: EntityReconciler,
}

#[derive(Debug, Default)]
struct SyncStats {
    listed: usize,
    created: usize,
    merged: usize,
    unchanged: usize,
    skipped: usize,
    new_downloads: usize,
}

impl LibrarySyncJob {
    pub fn new(source: Arc<dyn ImportSource>, reconciler: EntityReconciler) -> Self {
        Self { source, reconciler }
    }

    pub fn task_name(&self) -> String {
        format!("sync_{}", self.source.name())
    }

    fn breaker_name(&self) -> String {
        format!("source:{}", self.source.name())
    }

    async fn list_records(&self, ctx: &JobContext) -> Result<Vec<RawRecord>, JobError> {
        let breaker = ctx.breakers.get(&self.breaker_name());
        let source = self.source.as_ref();
        let timeout = ctx.call_timeout;

        ctx.retry
            .run(
                || {
                    breaker.call_classified(|| {
                        with_timeout(timeout, source.list_new_or_changed())
                    })
                },
                // An open breaker fails fast, waiting it out is the next cycle's job
                |e: &CircuitError<SourceError>| !e.is_open() && e.is_transient(),
            )
            .await
            .map_err(|e| JobError::from(e.into_inner()))
    }

    async fn reconcile_record(
        &self,
        ctx: &JobContext,
        record: &RawRecord,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        ctx.retry
            .run(
                || async {
                    in_session(ctx.store.as_ref(), |session| {
                        self.reconciler.reconcile(session, record, Utc::now())
                    })
                },
                |e: &ReconcileError| e.is_transient(),
            )
            .await
            .map_err(|e| e.into_inner())
    }

    /// Promoting a track is what queues it for download.
    fn is_new_download(record: &RawRecord, outcome: &ReconcileOutcome) -> bool {
        record.kind == EntityKind::Track && outcome.ownership == OwnershipTransition::Promoted
    }
}

#[async_trait]
impl BackgroundJob for LibrarySyncJob {
    async fn execute(&self, ctx: &JobContext) -> Result<TaskResult, JobError> {
        let source_name = self.source.name().to_string();
        let records = self.list_records(ctx).await?;

        let mut stats = SyncStats {
            listed: records.len(),
            ..Default::default()
        };
        debug!("Source {} listed {} records", source_name, records.len());

        for record in &records {
            if ctx.is_cancelled() {
                info!(
                    "Sync of {} cancelled after {} of {} records",
                    source_name,
                    stats.created + stats.merged + stats.unchanged + stats.skipped,
                    stats.listed
                );
                return Err(JobError::Cancelled);
            }

            match self.reconcile_record(ctx, record).await {
                Ok(outcome) => {
                    match outcome.action {
                        ReconcileAction::Created => stats.created += 1,
                        ReconcileAction::Merged => stats.merged += 1,
                        ReconcileAction::Unchanged => stats.unchanged += 1,
                    }
                    metrics::record_reconciled(&source_name, outcome.action.as_str());
                    if Self::is_new_download(record, &outcome) {
                        stats.new_downloads += 1;
                    }
                }
                Err(e) if !e.is_transient() => {
                    warn!(
                        "Skipping {} '{}' from {}: {}",
                        record.kind, record.name, source_name, e
                    );
                    stats.skipped += 1;
                    metrics::record_reconciled(&source_name, "skipped");
                }
                // Still contended after retries, let the whole execution retry
                Err(e) => return Err(e.into()),
            }
        }

        self.source.acknowledge();

        if stats.new_downloads > 0 && ctx.request_run(DOWNLOAD_DISPATCH_TASK) {
            debug!(
                "Requested {} for {} new tracks",
                DOWNLOAD_DISPATCH_TASK, stats.new_downloads
            );
        }

        info!(
            "Sync of {} completed: {} listed, {} created, {} merged, {} unchanged, {} skipped",
            source_name, stats.listed, stats.created, stats.merged, stats.unchanged, stats.skipped
        );

        Ok(TaskResult::ok()
            .with_stat("listed", stats.listed as f64)
            .with_stat("created", stats.created as f64)
            .with_stat("merged", stats.merged as f64)
            .with_stat("unchanged", stats.unchanged as f64)
            .with_stat("skipped", stats.skipped as f64)
            .with_stat("new_downloads", stats.new_downloads as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::Debouncer;
    use crate::import_source::LocalFolderSource;
    use crate::library_store::{LibraryStore, MemoryLibraryStore, OwnershipState};
    use crate::resilience::{BreakerRegistry, CircuitBreakerConfig, RetryPolicy};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Source replaying a fixed listing, optionally failing first.
    struct ScriptedSource {
        records: Vec<RawRecord>,
        failures_left: AtomicUsize,
        calls: AtomicUsize,
        acknowledged: Mutex<bool>,
    }

    impl ScriptedSource {
        fn new(records: Vec<RawRecord>) -> Arc<Self> {
            Arc::new(Self {
                records,
                failures_left: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                acknowledged: Mutex::new(false),
            })
        }

        fn failing(times: usize) -> Arc<Self> {
            let source = Self::new(Vec::new());
            source.failures_left.store(times, Ordering::SeqCst);
            source
        }
    }

    #[async_trait]
    impl ImportSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn list_new_or_changed(&self) -> Result<Vec<RawRecord>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(SourceError::Unavailable("connection refused".to_string()));
            }
            Ok(self.records.clone())
        }

        fn acknowledge(&self) {
            *self.acknowledged.lock().unwrap() = true;
        }
    }

    fn track(album: &str, title: &str) -> RawRecord {
        RawRecord::new("scripted", EntityKind::Track, title)
            .with_provider_id(format!("{}/{}", album, title))
            .with_parent(
                RawRecord::new("scripted", EntityKind::Album, album)
                    .with_parent(RawRecord::new("scripted", EntityKind::Artist, "Boards of Canada")),
            )
            .with_ownership(true)
    }

    fn context(store: Arc<dyn LibraryStore>, breakers: Arc<BreakerRegistry>) -> JobContext {
        JobContext::new(CancellationToken::new(), store, breakers).with_retry(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            jitter: false,
        })
    }

    #[tokio::test]
    async fn test_sync_reconciles_and_skips_malformed_records() {
        let store: Arc<dyn LibraryStore> = Arc::new(MemoryLibraryStore::new());
        let source = ScriptedSource::new(vec![
            track("Geogaddi", "Music Is Math"),
            track("Geogaddi", "Dawn Chorus"),
            RawRecord::new("scripted", EntityKind::Track, "   "),
            track("Geogaddi", "Music Is Math"),
        ]);
        let job = LibrarySyncJob::new(source.clone(), EntityReconciler::default());
        assert_eq!(job.task_name(), "sync_scripted");

        let ctx = context(store.clone(), Arc::new(BreakerRegistry::default()));
        let result = job.execute(&ctx).await.unwrap();

        assert_eq!(result.stat("listed"), Some(4.0));
        assert_eq!(result.stat("created"), Some(2.0));
        assert_eq!(result.stat("unchanged"), Some(1.0));
        assert_eq!(result.stat("skipped"), Some(1.0));
        assert_eq!(result.stat("new_downloads"), Some(2.0));
        assert!(*source.acknowledged.lock().unwrap());

        let session = store.begin().unwrap();
        let tracks = session.list_by_kind(EntityKind::Track).unwrap();
        assert_eq!(tracks.len(), 2);
        assert!(tracks.iter().all(|t| t.ownership_state == OwnershipState::Owned));
        assert_eq!(session.list_by_kind(EntityKind::Album).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_new_tracks_request_download_dispatch() {
        let store: Arc<dyn LibraryStore> = Arc::new(MemoryLibraryStore::new());
        let (debouncer, _rx) = Debouncer::new(Duration::from_secs(5));
        let ctx = context(store, Arc::new(BreakerRegistry::default())).with_debouncer(debouncer.clone());

        let job = LibrarySyncJob::new(
            ScriptedSource::new(vec![track("Campfire Headphase", "Chromakey Dreamcoat")]),
            EntityReconciler::default(),
        );
        job.execute(&ctx).await.unwrap();
        assert!(debouncer.is_pending(DOWNLOAD_DISPATCH_TASK));
    }

    #[tokio::test]
    async fn test_listing_failures_are_retried_then_trip_the_breaker() {
        let store: Arc<dyn LibraryStore> = Arc::new(MemoryLibraryStore::new());
        let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            open_timeout: Duration::from_secs(60),
        }));
        let ctx = context(store, breakers.clone());

        // Recovers on the second attempt
        let source = ScriptedSource::failing(1);
        let job = LibrarySyncJob::new(source.clone(), EntityReconciler::default());
        assert!(job.execute(&ctx).await.is_ok());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        // Two more failures open the breaker, the next execution fails fast
        let source = ScriptedSource::failing(10);
        let job = LibrarySyncJob::new(source.clone(), EntityReconciler::default());
        let err = job.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, JobError::Source(SourceError::Unavailable(_))));
        assert!(err.is_transient());

        let err = job.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, JobError::CircuitOpen { ref dependency } if dependency == "source:scripted"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(!*source.acknowledged.lock().unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_sync_does_not_acknowledge() {
        let store: Arc<dyn LibraryStore> = Arc::new(MemoryLibraryStore::new());
        let ctx = context(store.clone(), Arc::new(BreakerRegistry::default()));
        ctx.cancellation_token.cancel();

        let source = ScriptedSource::new(vec![track("Tomorrow's Harvest", "Reach for the Dead")]);
        let job = LibrarySyncJob::new(source.clone(), EntityReconciler::default());
        assert!(matches!(job.execute(&ctx).await, Err(JobError::Cancelled)));
        assert!(!*source.acknowledged.lock().unwrap());
        assert!(store.begin().unwrap().list_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_folder_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let album = dir.path().join("Portishead").join("Dummy");
        std::fs::create_dir_all(&album).unwrap();
        std::fs::write(album.join("01 - Mysterons.flac"), b"audio").unwrap();
        std::fs::write(album.join("02 - Sour Times.flac"), b"audio").unwrap();
        std::fs::write(album.join("cover.jpg"), b"image").unwrap();

        let store: Arc<dyn LibraryStore> = Arc::new(MemoryLibraryStore::new());
        let ctx = context(store.clone(), Arc::new(BreakerRegistry::default()));
        let source = Arc::new(LocalFolderSource::new("local", dir.path()));
        let job = LibrarySyncJob::new(source, EntityReconciler::default());

        let first = job.execute(&ctx).await.unwrap();
        assert_eq!(first.stat("created"), Some(2.0));

        // Nothing changed since the acknowledged listing
        let second = job.execute(&ctx).await.unwrap();
        assert_eq!(second.stat("listed"), Some(0.0));

        let session = store.begin().unwrap();
        let artists = session.list_by_kind(EntityKind::Artist).unwrap();
        assert_eq!(artists.len(), 1);
        assert_eq!(artists[0].name, "Portishead");
    }
}
