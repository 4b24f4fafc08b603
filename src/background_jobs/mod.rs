//! Background task scheduling and execution.
//!
//! This module provides the dependency-aware scheduler that drives library
//! sync, duplicate merging, ownership consistency, downloads and cleanup.

mod context;
mod dag;
mod debouncer;
mod job;
pub mod jobs;
mod scheduler;
mod status;

pub use context::JobContext;
pub use dag::{find_cycle, topological_order};
pub use debouncer::Debouncer;
pub use job::{BackgroundJob, JobError, TaskError, TaskResult};
pub use scheduler::{SchedulerError, TaskRegistration, TaskScheduler};
pub use status::{CycleReport, SkipReason, TaskOutcome, TaskRun, TaskStatus};
