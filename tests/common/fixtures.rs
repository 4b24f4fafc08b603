//! Test fixtures: a music folder on disk and a fake downloader service.

use super::constants::LIBRARY_FILES;
use anyhow::Result;
use axum::{extract::State, routing::post, Json, Router};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Creates a temporary music folder holding every file in `LIBRARY_FILES`.
pub fn create_test_library() -> Result<TempDir> {
    let dir = TempDir::new()?;
    for relative in LIBRARY_FILES {
        let path = dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, b"not really audio")?;
    }
    Ok(dir)
}

/// Requests received by the fake downloader, in arrival order.
pub type ReceivedDownloads = Arc<Mutex<Vec<Value>>>;

async fn accept_download(
    State(received): State<ReceivedDownloads>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let location = format!("/downloads/{}", body["track_id"]);
    received.lock().unwrap().push(body);
    Json(json!({ "location": location }))
}

/// Spawns a downloader service on a random port that accepts every request.
///
/// Returns its base URL and the requests it received.
pub async fn spawn_fake_downloader() -> (String, ReceivedDownloads) {
    let received: ReceivedDownloads = Arc::new(Mutex::new(Vec::new()));
    let router = Router::new()
        .route("/v1/download", post(accept_download))
        .with_state(received.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind fake downloader");
    let addr = listener.local_addr().expect("Failed to get local address");
    tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .expect("Fake downloader failed");
    });

    (format!("http://{}", addr), received)
}
