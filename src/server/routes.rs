//! Admin HTTP routes.
//!
//! Provides endpoints for:
//! - Listing task status and triggering or toggling tasks
//! - Inspecting circuit breakers
//! - Reading the duplicate review queue

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::state::{GuardedBreakers, GuardedLibraryStore, GuardedScheduler, ServerState};
use crate::background_jobs::{SchedulerError, TaskRun};
use crate::library_store::{EntityId, EntityKind, StoreResult};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledBody {
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct ReviewEntityView {
    pub id: EntityId,
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReviewItemView {
    pub kind: EntityKind,
    pub left: ReviewEntityView,
    pub right: ReviewEntityView,
    pub score: f64,
    pub queued_at: String,
}

fn scheduler_error_response(e: SchedulerError) -> Response {
    let status = match e {
        SchedulerError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, Json(ErrorResponse { error: e.to_string() })).into_response()
}

// =============================================================================
// Task Routes
// =============================================================================

/// GET /tasks - Status of every registered task
async fn list_tasks(State(scheduler): State<GuardedScheduler>) -> impl IntoResponse {
    Json(scheduler.get_status())
}

/// POST /tasks/{name}/run - Run a task now and return its outcome
async fn run_task(
    State(scheduler): State<GuardedScheduler>,
    Path(name): Path<String>,
) -> Response {
    info!("Manual trigger of task {}", name);
    match scheduler.run_task_now(&name).await {
        Ok(outcome) => Json(TaskRun {
            task: name,
            outcome,
        })
        .into_response(),
        Err(e) => scheduler_error_response(e),
    }
}

/// PUT /tasks/{name}/enabled - Enable or disable a task
async fn set_task_enabled(
    State(scheduler): State<GuardedScheduler>,
    Path(name): Path<String>,
    Json(body): Json<SetEnabledBody>,
) -> Response {
    if let Err(e) = scheduler.set_enabled(&name, body.enabled) {
        return scheduler_error_response(e);
    }
    match scheduler.get_status().into_iter().find(|s| s.name == name) {
        Some(status) => Json(status).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// =============================================================================
// Resilience and Library Routes
// =============================================================================

/// GET /circuits - Snapshot of every circuit breaker
async fn list_circuits(State(breakers): State<GuardedBreakers>) -> impl IntoResponse {
    Json(breakers.snapshots())
}

fn load_review_queue(store: &GuardedLibraryStore) -> StoreResult<Vec<ReviewItemView>> {
    let session = store.begin()?;
    let name_of = |id: EntityId| -> StoreResult<Option<String>> {
        Ok(session.get(id)?.map(|e| e.name))
    };

    let mut items = Vec::new();
    for item in session.review_queue()? {
        let candidate = item.candidate;
        items.push(ReviewItemView {
            kind: candidate.kind,
            left: ReviewEntityView {
                id: candidate.left,
                name: name_of(candidate.left)?,
            },
            right: ReviewEntityView {
                id: candidate.right,
                name: name_of(candidate.right)?,
            },
            score: candidate.score,
            queued_at: item.queued_at.to_rfc3339(),
        });
    }
    Ok(items)
}

/// GET /duplicates - Candidates waiting for manual review
async fn list_duplicates(State(store): State<GuardedLibraryStore>) -> Response {
    match load_review_queue(&store) {
        Ok(items) => Json(items).into_response(),
        Err(e) => {
            warn!("Failed to load review queue: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Router Construction
// =============================================================================

/// Build the admin routes, to be nested under `/v1/admin`.
///
/// - GET /tasks - List tasks
/// - POST /tasks/{name}/run - Trigger a task
/// - PUT /tasks/{name}/enabled - Enable or disable a task
/// - GET /circuits - Circuit breaker states
/// - GET /duplicates - Manual review queue
pub fn admin_routes() -> Router<ServerState> {
    Router::new()
        .route("/tasks", get(list_tasks))
        .route("/tasks/{name}/run", post(run_task))
        .route("/tasks/{name}/enabled", put(set_task_enabled))
        .route("/circuits", get(list_circuits))
        .route("/duplicates", get(list_duplicates))
}
