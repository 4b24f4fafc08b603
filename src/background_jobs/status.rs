//! Serializable views of the scheduler for status output.

use super::job::{TaskError, TaskResult};
use serde::Serialize;

/// Why a task did not execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A dependency did not complete successfully (in this cycle, or in its
    /// most recent execution for manual runs).
    DependencyUnmet,
    /// Another exclusive task holds the exclusive lock.
    ExclusiveBusy,
    AlreadyRunning,
    Disabled,
    ShuttingDown,
    /// A circuit breaker the task relies on is open.
    CircuitOpen,
    /// Shutdown cancelled the handler mid-run.
    Interrupted,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::DependencyUnmet => "dependency_unmet",
            SkipReason::ExclusiveBusy => "exclusive_busy",
            SkipReason::AlreadyRunning => "already_running",
            SkipReason::Disabled => "disabled",
            SkipReason::ShuttingDown => "shutting_down",
            SkipReason::CircuitOpen => "circuit_open",
            SkipReason::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded(TaskResult),
    Failed(TaskResult),
    Skipped(SkipReason),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded(_))
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            TaskOutcome::Skipped(reason) => Some(*reason),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&TaskResult> {
        match self {
            TaskOutcome::Succeeded(result) | TaskOutcome::Failed(result) => Some(result),
            TaskOutcome::Skipped(_) => None,
        }
    }
}

/// One entry of a [`CycleReport`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRun {
    pub task: String,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
}

/// Outcomes of the due tasks of one cycle, in execution order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub started_at: String,
    pub runs: Vec<TaskRun>,
}

impl CycleReport {
    pub fn outcome(&self, task: &str) -> Option<&TaskOutcome> {
        self.runs.iter().find(|r| r.task == task).map(|r| &r.outcome)
    }

    /// Names of the tasks whose handler actually ran.
    pub fn executed(&self) -> Vec<&str> {
        self.runs
            .iter()
            .filter(|r| r.outcome.result().is_some())
            .map(|r| r.task.as_str())
            .collect()
    }

    pub fn failures(&self) -> usize {
        self.runs
            .iter()
            .filter(|r| matches!(r.outcome, TaskOutcome::Failed(_)))
            .count()
    }
}

/// Information about a registered task for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub interval_secs: u64,
    pub exclusive: bool,
    pub depends_on: Vec<String>,
    pub running: bool,
    pub last_run_at: Option<String>,
    pub last_success_at: Option<String>,
    pub last_error: Option<TaskError>,
    /// None for disabled tasks.
    pub next_due_at: Option<String>,
}
