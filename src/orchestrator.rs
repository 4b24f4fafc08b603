//! Composition root.
//!
//! Builds the library store, the resilience primitives and every task from an
//! [`AppConfig`], then drives the scheduler: one cycle per tick, debounced
//! triggers as manual runs, and a bounded wait for the in-flight cycle on
//! shutdown.

use crate::background_jobs::jobs::{
    DownloadDispatchJob, DuplicateMergeJob, LibraryCleanupJob, LibrarySyncJob,
    OwnershipConsistencyJob, DOWNLOAD_DISPATCH_TASK, DUPLICATE_MERGE_TASK, LIBRARY_CLEANUP_TASK,
    OWNERSHIP_CONSISTENCY_TASK,
};
use crate::background_jobs::{
    Debouncer, JobContext, SchedulerError, TaskOutcome, TaskRegistration,
    TaskScheduler, TaskStatus,
};
use crate::cleanup::CleanupEngine;
use crate::config::AppConfig;
use crate::downloader::{Downloader, HttpDownloader};
use crate::import_source::{ImportSource, LocalFolderSource};
use crate::library_store::{LibraryStore, MemoryLibraryStore, SqliteLibraryStore};
use crate::ownership::OwnershipEngine;
use crate::reconciler::EntityReconciler;
use crate::resilience::{BreakerRegistry, CircuitBreakerConfig, RetryPolicy};
use crate::server::ServerState;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a running service is made of.
pub struct Orchestrator {
    scheduler: Arc<TaskScheduler>,
    breakers: Arc<BreakerRegistry>,
    store: Arc<dyn LibraryStore>,
    fired_rx: mpsc::Receiver<String>,
    shutdown: CancellationToken,
    tick_interval: Duration,
    shutdown_grace: Duration,
}

impl Orchestrator {
    /// Build the production wiring: SQLite store when a db dir is configured,
    /// local folder sources, and the HTTP downloader when a URL is set.
    pub fn new(config: &AppConfig, shutdown: CancellationToken) -> Result<Self> {
        let store: Arc<dyn LibraryStore> = match config.library_db_path() {
            Some(path) => {
                info!("Opening library database at {:?}...", path);
                Arc::new(
                    SqliteLibraryStore::new(&path)
                        .with_context(|| format!("Failed to open library database {:?}", path))?,
                )
            }
            None => {
                warn!("No db_dir configured, library state will not survive a restart");
                Arc::new(MemoryLibraryStore::new())
            }
        };

        let sources: Vec<Arc<dyn ImportSource>> = config
            .sources
            .iter()
            .map(|source| {
                info!("Import source {} at {:?}", source.name, source.path);
                Arc::new(LocalFolderSource::new(source.name.clone(), source.path.clone()))
                    as Arc<dyn ImportSource>
            })
            .collect();

        let downloader = match &config.downloader_url {
            Some(url) if config.downloader.enabled => {
                info!("Downloader service configured at {}", url);
                let client = HttpDownloader::new(
                    url,
                    Duration::from_secs(config.downloader.timeout_secs),
                )
                .context("Failed to build downloader client")?;
                Some(Arc::new(client) as Arc<dyn Downloader>)
            }
            _ => None,
        };

        Self::with_parts(config, store, sources, downloader, shutdown)
    }

    /// Wire the scheduler around caller-provided parts.
    pub fn with_parts(
        config: &AppConfig,
        store: Arc<dyn LibraryStore>,
        sources: Vec<Arc<dyn ImportSource>>,
        downloader: Option<Arc<dyn Downloader>>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig::from(
            &config.circuit_breaker,
        )));
        let (debouncer, fired_rx) = Debouncer::new(config.scheduler.debounce_cooldown());
        let retry = RetryPolicy::new(&config.retry);

        let context = JobContext::new(shutdown.clone(), store.clone(), breakers.clone())
            .with_retry(retry.clone())
            .with_call_timeout(config.retry.call_timeout())
            .with_debouncer(debouncer);
        let mut scheduler = TaskScheduler::new(context, retry, config.retry.attempt_timeout());

        register_tasks(&mut scheduler, config, sources, downloader)?;

        for name in &config.scheduler.disabled_tasks {
            match scheduler.set_enabled(name, false) {
                Ok(()) => info!("Task {} disabled by configuration", name),
                Err(SchedulerError::TaskNotFound(_)) => {
                    warn!("Ignoring unknown task {} in disabled_tasks", name)
                }
                Err(e) => return Err(e.into()),
            }
        }

        scheduler.validate().context("Invalid task graph")?;
        info!(
            "Registered tasks in execution order: {}",
            scheduler.execution_order().join(", ")
        );

        Ok(Self {
            scheduler: Arc::new(scheduler),
            breakers,
            store,
            fired_rx,
            shutdown,
            tick_interval: config.scheduler.tick_interval(),
            shutdown_grace: Duration::from_secs(config.scheduler.shutdown_grace_secs),
        })
    }

    pub fn scheduler(&self) -> Arc<TaskScheduler> {
        self.scheduler.clone()
    }

    pub fn store(&self) -> Arc<dyn LibraryStore> {
        self.store.clone()
    }

    /// State for the admin server, sharing this orchestrator's scheduler.
    pub fn server_state(&self) -> ServerState {
        ServerState::new(
            self.scheduler.clone(),
            self.breakers.clone(),
            self.store.clone(),
        )
    }

    pub fn status(&self) -> Vec<TaskStatus> {
        self.scheduler.get_status()
    }

    pub async fn trigger(&self, task: &str) -> Result<TaskOutcome, SchedulerError> {
        self.scheduler.run_task_now(task).await
    }

    /// Run until the shutdown token is cancelled.
    pub async fn run(mut self) {
        info!(
            "Orchestrator started, ticking every {:?}",
            self.tick_interval
        );

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.run_cycle().await {
                        break;
                    }
                }
                Some(task) = self.fired_rx.recv() => {
                    self.run_triggered(&task).await;
                }
                _ = self.shutdown.cancelled() => {
                    info!("Orchestrator received shutdown signal");
                    break;
                }
            }
        }

        info!("Orchestrator stopped");
    }

    /// Returns false if shutdown arrived while the cycle was running.
    async fn run_cycle(&self) -> bool {
        let scheduler = self.scheduler.clone();
        let cycle = async move { scheduler.run_cycle().await };
        tokio::pin!(cycle);

        tokio::select! {
            report = &mut cycle => {
                debug!("Cycle started at {} ran {} tasks", report.started_at, report.executed().len());
                true
            }
            _ = self.shutdown.cancelled() => {
                info!(
                    "Shutdown requested mid-cycle, waiting up to {:?} for running tasks",
                    self.shutdown_grace
                );
                match tokio::time::timeout(self.shutdown_grace, cycle).await {
                    Ok(report) => info!("In-flight cycle finished with {} failures", report.failures()),
                    Err(_) => warn!("Shutdown grace period elapsed with tasks still running"),
                }
                false
            }
        }
    }

    async fn run_triggered(&self, task: &str) {
        if !self.scheduler.contains(task) {
            debug!("Ignoring debounced trigger for unregistered task {}", task);
            return;
        }
        match self.scheduler.run_task_now(task).await {
            Ok(outcome) => debug!("Debounced run of {}: {:?}", task, outcome),
            Err(e) => warn!("Debounced run of {} failed: {}", task, e),
        }
    }
}

fn register_tasks(
    scheduler: &mut TaskScheduler,
    config: &AppConfig,
    sources: Vec<Arc<dyn ImportSource>>,
    downloader: Option<Arc<dyn Downloader>>,
) -> Result<()> {
    let sched = &config.scheduler;
    let ownership = OwnershipEngine::new(config.ownership.clone());
    let reconciler = EntityReconciler::new(ownership.clone());

    let mut sync_tasks = Vec::new();
    for source in sources {
        let job = LibrarySyncJob::new(source.clone(), reconciler.clone());
        let name = job.task_name();
        scheduler.register(
            TaskRegistration::new(
                name.clone(),
                Duration::from_secs(sched.sync_interval_secs),
                Arc::new(job),
            )
            .description(format!("Import new and changed records from {}", source.name())),
        )?;
        sync_tasks.push(name);
    }
    if sync_tasks.is_empty() {
        warn!("No import sources configured");
    }

    scheduler.register(
        TaskRegistration::new(
            DUPLICATE_MERGE_TASK,
            Duration::from_secs(sched.duplicate_merge_interval_secs),
            Arc::new(DuplicateMergeJob::new(
                reconciler,
                config.reconciler.clone(),
            )),
        )
        .depends_on(sync_tasks.iter().cloned())
        .exclusive()
        .description("Merge or queue for review near-duplicate entities"),
    )?;

    scheduler.register(
        TaskRegistration::new(
            OWNERSHIP_CONSISTENCY_TASK,
            Duration::from_secs(sched.ownership_interval_secs),
            Arc::new(OwnershipConsistencyJob::new(ownership)),
        )
        .depends_on(sync_tasks.iter().cloned())
        .description("Promote and demote parents to match their children"),
    )?;

    match downloader {
        Some(downloader) => scheduler.register(
            TaskRegistration::new(
                DOWNLOAD_DISPATCH_TASK,
                Duration::from_secs(sched.download_interval_secs),
                Arc::new(DownloadDispatchJob::new(downloader, config.downloader.clone())),
            )
            .depends_on([OWNERSHIP_CONSISTENCY_TASK])
            .description("Send pending owned tracks to the downloader"),
        )?,
        None => info!("No downloader configured, {} not registered", DOWNLOAD_DISPATCH_TASK),
    }

    scheduler.register(
        TaskRegistration::new(
            LIBRARY_CLEANUP_TASK,
            Duration::from_secs(sched.cleanup_interval_secs),
            Arc::new(LibraryCleanupJob::new(CleanupEngine::new(
                config.cleanup.clone(),
            ))),
        )
        .depends_on([OWNERSHIP_CONSISTENCY_TASK, DUPLICATE_MERGE_TASK])
        .exclusive()
        .description("Repair orphans and reset expired download states"),
    )?;

    Ok(())
}
