use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub port: Option<u16>,
    pub library_path: Option<String>,
    pub downloader_url: Option<String>,

    // Feature configs
    pub scheduler: Option<SchedulerConfig>,
    pub retry: Option<RetryConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub reconciler: Option<ReconcilerConfig>,
    pub ownership: Option<OwnershipConfig>,
    pub cleanup: Option<CleanupConfig>,
    pub downloader: Option<DownloaderConfig>,
    pub sources: Option<Vec<SourceConfig>>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_secs: Option<u64>,
    pub debounce_cooldown_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
    pub sync_interval_secs: Option<u64>,
    pub duplicate_merge_interval_secs: Option<u64>,
    pub ownership_interval_secs: Option<u64>,
    pub download_interval_secs: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
    /// Task names registered disabled at startup.
    pub disabled_tasks: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub attempt_timeout_secs: Option<u64>,
    pub call_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: Option<u32>,
    pub open_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub auto_merge_threshold: Option<f64>,
    pub review_threshold: Option<f64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct OwnershipConfig {
    pub promote_parents: Option<bool>,
    pub demote_orphaned_parents: Option<bool>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct CleanupConfig {
    pub failed_grace_period_secs: Option<u64>,
    pub stale_in_progress_threshold_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct DownloaderConfig {
    pub timeout_secs: Option<u64>,
    pub max_concurrent: Option<usize>,
    pub batch_size: Option<usize>,
}

/// One `[[sources]]` entry.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub name: String,
    /// Currently only "local_folder".
    #[serde(default = "default_source_kind")]
    pub kind: String,
    pub path: String,
}

fn default_source_kind() -> String {
    "local_folder".to_string()
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
