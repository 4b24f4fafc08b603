pub mod metrics;
mod routes;
pub mod state;

pub use routes::{ErrorResponse, ReviewItemView};
pub use state::ServerState;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::{self, Next},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Serialize)]
struct ServerStats {
    pub uptime: String,
    pub tasks: usize,
    pub running: Vec<String>,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

async fn home(State(state): State<ServerState>) -> impl IntoResponse {
    let status = state.scheduler.get_status();
    Json(ServerStats {
        uptime: format_uptime(state.start_time.elapsed()),
        tasks: status.len(),
        running: status
            .into_iter()
            .filter(|s| s.running)
            .map(|s| s.name)
            .collect(),
    })
}

async fn log_requests(request: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();
    let method = request.method().to_string();
    let uri = request.uri().to_string();
    debug!(">>> {} {}", method, uri);

    let response = next.run(request).await;
    debug!(
        "<<< {} {} {} in {:?}",
        method,
        uri,
        response.status().as_u16(),
        start.elapsed()
    );
    response
}

pub fn make_app(state: ServerState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/metrics", get(metrics::metrics_handler))
        .nest("/v1/admin", routes::admin_routes())
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

/// Serve the admin surface until `shutdown` is cancelled.
pub async fn run_server(state: ServerState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let app = make_app(state);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .with_context(|| format!("Failed to bind admin server to port {}", port))?;
    info!("Admin server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
