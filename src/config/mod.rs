mod file_config;

pub use file_config::{
    CircuitBreakerConfig, CleanupConfig, DownloaderConfig, FileConfig, OwnershipConfig,
    ReconcilerConfig, RetryConfig, SchedulerConfig, SourceConfig,
};

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub port: u16,
    pub tick_interval_secs: u64,
    pub library_path: Option<PathBuf>,
    pub downloader_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    /// Directory holding `library.db`. `None` runs on the in-memory store.
    pub db_dir: Option<PathBuf>,
    pub port: u16,
    pub downloader_url: Option<String>,

    // Feature configs (with defaults)
    pub scheduler: SchedulerSettings,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub reconciler: ReconcilerSettings,
    pub ownership: OwnershipSettings,
    pub cleanup: CleanupSettings,
    pub downloader: DownloaderSettings,
    pub sources: Vec<SourceSettings>,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone());

        if let Some(dir) = &db_dir {
            if !dir.exists() {
                bail!("Database directory does not exist: {:?}", dir);
            }
            if !dir.is_dir() {
                bail!("db_dir is not a directory: {:?}", dir);
            }
        }

        let port = file.port.unwrap_or(cli.port);

        let downloader_url = file
            .downloader_url
            .clone()
            .or_else(|| cli.downloader_url.clone());

        let sched_file = file.scheduler.unwrap_or_default();
        let sched_defaults = SchedulerSettings::default();
        let cli_tick = if cli.tick_interval_secs > 0 {
            cli.tick_interval_secs
        } else {
            sched_defaults.tick_interval_secs
        };
        let scheduler = SchedulerSettings {
            tick_interval_secs: sched_file.tick_interval_secs.unwrap_or(cli_tick),
            debounce_cooldown_secs: sched_file
                .debounce_cooldown_secs
                .unwrap_or(sched_defaults.debounce_cooldown_secs),
            shutdown_grace_secs: sched_file
                .shutdown_grace_secs
                .unwrap_or(sched_defaults.shutdown_grace_secs),
            sync_interval_secs: sched_file
                .sync_interval_secs
                .unwrap_or(sched_defaults.sync_interval_secs),
            duplicate_merge_interval_secs: sched_file
                .duplicate_merge_interval_secs
                .unwrap_or(sched_defaults.duplicate_merge_interval_secs),
            ownership_interval_secs: sched_file
                .ownership_interval_secs
                .unwrap_or(sched_defaults.ownership_interval_secs),
            download_interval_secs: sched_file
                .download_interval_secs
                .unwrap_or(sched_defaults.download_interval_secs),
            cleanup_interval_secs: sched_file
                .cleanup_interval_secs
                .unwrap_or(sched_defaults.cleanup_interval_secs),
            disabled_tasks: sched_file.disabled_tasks.unwrap_or_default(),
        };
        if scheduler.tick_interval_secs == 0 {
            bail!("scheduler.tick_interval_secs must be greater than zero");
        }

        let retry_file = file.retry.unwrap_or_default();
        let retry_defaults = RetrySettings::default();
        let retry = RetrySettings {
            max_attempts: retry_file.max_attempts.unwrap_or(retry_defaults.max_attempts),
            base_delay_ms: retry_file
                .base_delay_ms
                .unwrap_or(retry_defaults.base_delay_ms),
            max_delay_ms: retry_file.max_delay_ms.unwrap_or(retry_defaults.max_delay_ms),
            backoff_factor: retry_file
                .backoff_factor
                .unwrap_or(retry_defaults.backoff_factor),
            attempt_timeout_secs: retry_file
                .attempt_timeout_secs
                .unwrap_or(retry_defaults.attempt_timeout_secs),
            call_timeout_secs: retry_file
                .call_timeout_secs
                .unwrap_or(retry_defaults.call_timeout_secs),
        };
        if retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if retry.backoff_factor < 1.0 {
            bail!(
                "retry.backoff_factor must be >= 1.0, got {}",
                retry.backoff_factor
            );
        }

        let cb_file = file.circuit_breaker.unwrap_or_default();
        let cb_defaults = CircuitBreakerSettings::default();
        let circuit_breaker = CircuitBreakerSettings {
            failure_threshold: cb_file
                .failure_threshold
                .unwrap_or(cb_defaults.failure_threshold),
            open_timeout_secs: cb_file
                .open_timeout_secs
                .unwrap_or(cb_defaults.open_timeout_secs),
        };
        if circuit_breaker.failure_threshold == 0 {
            bail!("circuit_breaker.failure_threshold must be at least 1");
        }

        let rec_file = file.reconciler.unwrap_or_default();
        let rec_defaults = ReconcilerSettings::default();
        let reconciler = ReconcilerSettings {
            auto_merge_threshold: rec_file
                .auto_merge_threshold
                .unwrap_or(rec_defaults.auto_merge_threshold),
            review_threshold: rec_file
                .review_threshold
                .unwrap_or(rec_defaults.review_threshold),
        };
        validate_threshold("reconciler.auto_merge_threshold", reconciler.auto_merge_threshold)?;
        validate_threshold("reconciler.review_threshold", reconciler.review_threshold)?;
        if reconciler.review_threshold > reconciler.auto_merge_threshold {
            bail!(
                "reconciler.review_threshold ({}) must not exceed auto_merge_threshold ({})",
                reconciler.review_threshold,
                reconciler.auto_merge_threshold
            );
        }

        let own_file = file.ownership.unwrap_or_default();
        let own_defaults = OwnershipSettings::default();
        let ownership = OwnershipSettings {
            promote_parents: own_file
                .promote_parents
                .unwrap_or(own_defaults.promote_parents),
            demote_orphaned_parents: own_file
                .demote_orphaned_parents
                .unwrap_or(own_defaults.demote_orphaned_parents),
        };

        let cleanup_file = file.cleanup.unwrap_or_default();
        let cleanup_defaults = CleanupSettings::default();
        let cleanup = CleanupSettings {
            failed_grace_period_secs: cleanup_file
                .failed_grace_period_secs
                .unwrap_or(cleanup_defaults.failed_grace_period_secs),
            stale_in_progress_threshold_secs: cleanup_file
                .stale_in_progress_threshold_secs
                .unwrap_or(cleanup_defaults.stale_in_progress_threshold_secs),
        };

        let dl_file = file.downloader.unwrap_or_default();
        let dl_defaults = DownloaderSettings::default();
        let downloader = DownloaderSettings {
            enabled: downloader_url.is_some(),
            timeout_secs: dl_file.timeout_secs.unwrap_or(dl_defaults.timeout_secs),
            max_concurrent: dl_file.max_concurrent.unwrap_or(dl_defaults.max_concurrent),
            batch_size: dl_file.batch_size.unwrap_or(dl_defaults.batch_size),
        };
        if downloader.max_concurrent == 0 {
            bail!("downloader.max_concurrent must be at least 1");
        }

        // [[sources]] takes precedence; --library-path is shorthand for a single
        // local folder source named "local".
        let mut sources = Vec::new();
        if let Some(file_sources) = file.sources {
            for src in file_sources {
                if src.kind != "local_folder" {
                    bail!("Unknown source kind '{}' for source '{}'", src.kind, src.name);
                }
                sources.push(SourceSettings {
                    name: src.name,
                    path: PathBuf::from(src.path),
                });
            }
        } else if let Some(path) = file
            .library_path
            .map(PathBuf::from)
            .or_else(|| cli.library_path.clone())
        {
            sources.push(SourceSettings {
                name: "local".to_string(),
                path,
            });
        }

        for src in &sources {
            if src.name.is_empty() {
                bail!("Source names must not be empty");
            }
            if !src.path.is_dir() {
                bail!(
                    "Library path for source '{}' is not a directory: {:?}",
                    src.name,
                    src.path
                );
            }
        }
        let mut names: Vec<&str> = sources.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            bail!("Duplicate source name: {}", dup[0]);
        }

        Ok(Self {
            db_dir,
            port,
            downloader_url,
            scheduler,
            retry,
            circuit_breaker,
            reconciler,
            ownership,
            cleanup,
            downloader,
            sources,
        })
    }

    pub fn library_db_path(&self) -> Option<PathBuf> {
        self.db_dir.as_ref().map(|dir| dir.join("library.db"))
    }
}

fn validate_threshold(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) || value == 0.0 {
        bail!("{} must be in (0, 1], got {}", name, value);
    }
    Ok(())
}

/// A dependent task only runs in a cycle where all of its dependencies ran
/// and succeeded, so its effective interval is the least multiple of theirs
/// that is at least its own. Keep each interval a multiple of its
/// dependencies' intervals: ownership and duplicate merge follow sync,
/// download follows ownership, cleanup follows ownership and duplicate merge.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval_secs: u64,
    pub debounce_cooldown_secs: u64,
    pub shutdown_grace_secs: u64,
    pub sync_interval_secs: u64,
    pub duplicate_merge_interval_secs: u64,
    pub ownership_interval_secs: u64,
    pub download_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub disabled_tasks: Vec<String>,
}

impl SchedulerSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn debounce_cooldown(&self) -> Duration {
        Duration::from_secs(self.debounce_cooldown_secs)
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            debounce_cooldown_secs: 5,
            shutdown_grace_secs: 30,
            sync_interval_secs: 900,
            duplicate_merge_interval_secs: 3600,
            ownership_interval_secs: 900,
            download_interval_secs: 900,
            cleanup_interval_secs: 86400, // 24 hours
            disabled_tasks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    /// Upper bound for a single attempt of a task handler.
    pub attempt_timeout_secs: u64,
    /// Upper bound for a single call to an import source or the downloader.
    pub call_timeout_secs: u64,
}

impl RetrySettings {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            backoff_factor: 2.0,
            attempt_timeout_secs: 300,
            call_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub open_timeout_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub auto_merge_threshold: f64,
    pub review_threshold: f64,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            auto_merge_threshold: 0.95,
            review_threshold: 0.85,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OwnershipSettings {
    pub promote_parents: bool,
    pub demote_orphaned_parents: bool,
}

impl Default for OwnershipSettings {
    fn default() -> Self {
        Self {
            promote_parents: true,
            demote_orphaned_parents: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CleanupSettings {
    pub failed_grace_period_secs: u64,
    pub stale_in_progress_threshold_secs: u64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            failed_grace_period_secs: 86400,
            stale_in_progress_threshold_secs: 3600,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloaderSettings {
    pub enabled: bool, // true if downloader_url is set
    pub timeout_secs: u64,
    pub max_concurrent: usize,
    pub batch_size: usize,
}

impl Default for DownloaderSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 300,
            max_concurrent: 4,
            batch_size: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub name: String,
    pub path: PathBuf,
}
