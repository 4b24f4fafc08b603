//! Test server lifecycle management
//!
//! Each test gets an isolated admin server over its own music folder and
//! SQLite library.

use super::constants::*;
use super::fixtures::{create_test_library, spawn_fake_downloader, ReceivedDownloads};
use musiclib_sync::config::{AppConfig, CliConfig};
use musiclib_sync::downloader::{Downloader, HttpDownloader};
use musiclib_sync::import_source::{ImportSource, LocalFolderSource};
use musiclib_sync::library_store::{LibraryStore, SqliteLibraryStore};
use musiclib_sync::orchestrator::Orchestrator;
use musiclib_sync::server::{make_app, metrics};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Test server instance with an isolated library.
///
/// The scheduler loop is not running: tasks only run when a test triggers
/// them through the admin API. When dropped, the server shuts down and temp
/// resources are cleaned up.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// The library, for direct inspection in tests
    pub store: Arc<dyn LibraryStore>,

    /// Requests seen by the fake downloader, if one was spawned
    pub downloads: Option<ReceivedDownloads>,

    // Keep resources alive until drop
    _temp_library_dir: TempDir,
    _temp_db_dir: TempDir,
    shutdown: CancellationToken,
}

impl TestServer {
    /// Spawns a server without a downloader
    pub async fn spawn() -> Self {
        Self::spawn_inner(false).await
    }

    /// Spawns a server whose downloader is a fake service accepting everything
    pub async fn spawn_with_downloader() -> Self {
        Self::spawn_inner(true).await
    }

    async fn spawn_inner(with_downloader: bool) -> Self {
        metrics::init_metrics();

        let temp_library_dir = create_test_library().expect("Failed to create test library");
        let temp_db_dir = TempDir::new().expect("Failed to create temp db dir");

        let cli = CliConfig {
            db_dir: Some(temp_db_dir.path().to_path_buf()),
            ..Default::default()
        };
        let mut config = AppConfig::resolve(&cli, None).expect("Failed to resolve config");
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 5;

        let store: Arc<dyn LibraryStore> = Arc::new(
            SqliteLibraryStore::new(config.library_db_path().expect("db_dir is set"))
                .expect("Failed to open library store"),
        );
        let sources: Vec<Arc<dyn ImportSource>> = vec![Arc::new(LocalFolderSource::new(
            SOURCE_NAME,
            temp_library_dir.path(),
        ))];

        let (downloader, downloads) = if with_downloader {
            let (url, received) = spawn_fake_downloader().await;
            let client = HttpDownloader::new(&url, Duration::from_secs(5))
                .expect("Failed to build downloader client");
            (
                Some(Arc::new(client) as Arc<dyn Downloader>),
                Some(received),
            )
        } else {
            (None, None)
        };

        let shutdown = CancellationToken::new();
        let orchestrator = Orchestrator::with_parts(
            &config,
            store.clone(),
            sources,
            downloader,
            shutdown.clone(),
        )
        .expect("Failed to build orchestrator");
        let app = make_app(orchestrator.server_state());

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await
                .expect("Server failed");
        });

        let server = Self {
            base_url: format!("http://127.0.0.1:{}", port),
            store,
            downloads,
            _temp_library_dir: temp_library_dir,
            _temp_db_dir: temp_db_dir,
            shutdown,
        };
        server.wait_for_ready().await;
        server
    }

    /// Waits for the server to become ready by polling `/`
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => return,
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
