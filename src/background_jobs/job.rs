use super::context::JobContext;
use crate::import_source::SourceError;
use crate::library_store::StoreError;
use crate::reconciler::ReconcileError;
use crate::resilience::{CircuitError, Classify, ErrorClass};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::time::error::Elapsed;

/// Errors a job execution can end with.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job was cancelled")]
    Cancelled,

    #[error("Job timed out")]
    Timeout,

    #[error("Circuit open for {dependency}")]
    CircuitOpen { dependency: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("Execution failed: {message}")]
    ExecutionFailed { class: ErrorClass, message: String },
}

impl JobError {
    pub fn transient(message: impl Into<String>) -> Self {
        JobError::ExecutionFailed {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        JobError::ExecutionFailed {
            class: ErrorClass::Terminal,
            message: message.into(),
        }
    }
}

impl From<Elapsed> for JobError {
    fn from(_: Elapsed) -> Self {
        JobError::Timeout
    }
}

impl<E: Into<JobError>> From<CircuitError<E>> for JobError {
    fn from(e: CircuitError<E>) -> Self {
        match e {
            CircuitError::Open { dependency, .. } => JobError::CircuitOpen { dependency },
            CircuitError::Inner(inner) => inner.into(),
        }
    }
}

impl Classify for JobError {
    fn classify(&self) -> ErrorClass {
        match self {
            JobError::Cancelled => ErrorClass::Terminal,
            JobError::Timeout | JobError::CircuitOpen { .. } => ErrorClass::Transient,
            JobError::Store(e) => e.classify(),
            JobError::Source(e) => e.classify(),
            JobError::Reconcile(e) => e.classify(),
            JobError::ExecutionFailed { class, .. } => *class,
        }
    }
}

/// Error part of a [`TaskResult`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskError {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&JobError> for TaskError {
    fn from(e: &JobError) -> Self {
        TaskError {
            class: e.classify(),
            message: e.to_string(),
        }
    }
}

/// What a task execution produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub success: bool,
    pub stats: BTreeMap<String, f64>,
    pub error: Option<TaskError>,
}

impl TaskResult {
    pub fn ok() -> Self {
        TaskResult {
            success: true,
            stats: BTreeMap::new(),
            error: None,
        }
    }

    pub fn failed(error: &JobError) -> Self {
        TaskResult {
            success: false,
            stats: BTreeMap::new(),
            error: Some(error.into()),
        }
    }

    pub fn with_stat(mut self, key: &str, value: impl Into<f64>) -> Self {
        self.stats.insert(key.to_string(), value.into());
        self
    }

    pub fn stat(&self, key: &str) -> Option<f64> {
        self.stats.get(key).copied()
    }
}

/// Work a scheduled task performs.
///
/// Jobs run on the async runtime. Library sessions are synchronous and must
/// be opened and committed between awaits, never held across one.
/// Long-running jobs should check `ctx.is_cancelled()` between units of work.
#[async_trait]
pub trait BackgroundJob: Send + Sync {
    async fn execute(&self, ctx: &JobContext) -> Result<TaskResult, JobError>;
}
