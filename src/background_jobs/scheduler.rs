use super::context::JobContext;
use super::dag;
use super::job::{BackgroundJob, JobError, TaskError, TaskResult};
use super::status::{CycleReport, SkipReason, TaskOutcome, TaskRun, TaskStatus};
use crate::resilience::{with_timeout, Classify, RetryPolicy};
use crate::server::metrics;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Task {0} is already registered")]
    DuplicateTask(String),

    #[error("Registering {task} would create a dependency cycle: {}", cycle.join(" -> "))]
    CyclicDependency { task: String, cycle: Vec<String> },

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Task {0} not found")]
    TaskNotFound(String),
}

/// Declaration of a task, handed to [`TaskScheduler::register`].
pub struct TaskRegistration {
    name: String,
    interval: Duration,
    handler: Arc<dyn BackgroundJob>,
    depends_on: Vec<String>,
    exclusive: bool,
    enabled: bool,
    description: String,
}

impl TaskRegistration {
    pub fn new(name: impl Into<String>, interval: Duration, handler: Arc<dyn BackgroundJob>) -> Self {
        Self {
            name: name.into(),
            interval,
            handler,
            depends_on: Vec::new(),
            exclusive: false,
            enabled: true,
            description: String::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            if !self.depends_on.contains(&name) {
                self.depends_on.push(name);
            }
        }
        self
    }

    /// At most one exclusive task executes at any time.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Default)]
struct TaskRuntime {
    enabled: bool,
    last_run_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_error: Option<TaskError>,
    running: bool,
}

struct ScheduledTask {
    name: String,
    interval: Duration,
    depends_on: Vec<String>,
    exclusive: bool,
    description: String,
    handler: Arc<dyn BackgroundJob>,
    runtime: Mutex<TaskRuntime>,
}

impl ScheduledTask {
    fn interval_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.interval)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100))
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        let runtime = self.runtime.lock().unwrap();
        runtime.enabled
            && runtime
                .last_run_at
                .map_or(true, |last| now - last >= self.interval_chrono())
    }

    /// Most recent execution succeeded.
    fn last_execution_succeeded(&self) -> bool {
        let runtime = self.runtime.lock().unwrap();
        runtime.last_success_at.is_some() && runtime.last_error.is_none()
    }
}

/// Clears the running flag when an execution ends, however it ends.
struct RunningGuard<'a> {
    task: &'a ScheduledTask,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.task.runtime.lock().unwrap().running = false;
        metrics::set_task_running(&self.task.name, false);
    }
}

/// Registry of interval tasks with dependencies between them.
///
/// Cycles run due tasks one after another in dependency order. Manual runs
/// and cycles share [`TaskScheduler::execute_task`] and may overlap; the
/// running flag and the exclusive lock keep them apart.
pub struct TaskScheduler {
    tasks: Vec<ScheduledTask>,
    index: HashMap<String, usize>,
    exclusive_lock: tokio::sync::Mutex<()>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    context: JobContext,
}

impl TaskScheduler {
    pub fn new(context: JobContext, retry: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            tasks: Vec::new(),
            index: HashMap::new(),
            exclusive_lock: tokio::sync::Mutex::new(()),
            retry,
            attempt_timeout,
            context,
        }
    }

    pub fn context(&self) -> &JobContext {
        &self.context
    }

    /// Register a task. A rejected registration leaves the registry as it was.
    ///
    /// Dependencies may name tasks registered later; [`TaskScheduler::validate`]
    /// reports the ones that never showed up.
    pub fn register(&mut self, registration: TaskRegistration) -> Result<(), SchedulerError> {
        if self.index.contains_key(&registration.name) {
            return Err(SchedulerError::DuplicateTask(registration.name));
        }

        let mut names = self.names();
        names.push(registration.name.clone());
        let mut depends_on = self.dependency_map();
        depends_on.insert(registration.name.clone(), registration.depends_on.clone());
        if let Some(cycle) = dag::find_cycle(&names, &depends_on) {
            return Err(SchedulerError::CyclicDependency {
                task: registration.name,
                cycle,
            });
        }

        info!(
            "Registering task: {} every {:?}{}",
            registration.name,
            registration.interval,
            if registration.depends_on.is_empty() {
                String::new()
            } else {
                format!(" after {}", registration.depends_on.join(", "))
            }
        );

        self.index
            .insert(registration.name.clone(), self.tasks.len());
        self.tasks.push(ScheduledTask {
            name: registration.name,
            interval: registration.interval,
            depends_on: registration.depends_on,
            exclusive: registration.exclusive,
            description: registration.description,
            handler: registration.handler,
            runtime: Mutex::new(TaskRuntime {
                enabled: registration.enabled,
                ..Default::default()
            }),
        });
        Ok(())
    }

    /// Check that every dependency names a registered task.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        for task in &self.tasks {
            if let Some(missing) = task.depends_on.iter().find(|d| !self.index.contains_key(*d)) {
                return Err(SchedulerError::UnknownDependency {
                    task: task.name.clone(),
                    dependency: missing.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Registered task names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.name.clone()).collect()
    }

    fn dependency_map(&self) -> HashMap<String, Vec<String>> {
        self.tasks
            .iter()
            .map(|t| (t.name.clone(), t.depends_on.clone()))
            .collect()
    }

    fn task(&self, name: &str) -> Result<&ScheduledTask, SchedulerError> {
        self.index
            .get(name)
            .map(|&i| &self.tasks[i])
            .ok_or_else(|| SchedulerError::TaskNotFound(name.to_string()))
    }

    /// All tasks in dependency order, ties broken by registration order.
    pub fn execution_order(&self) -> Vec<String> {
        match dag::topological_order(&self.names(), &self.dependency_map()) {
            Ok(order) => order,
            Err(remaining) => {
                // register() rejects cycles, so this is unreachable in practice
                error!("Dependency cycle among {:?}", remaining);
                self.names()
            }
        }
    }

    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run every task due at `now`, in dependency order. A due task whose
    /// dependencies did not all succeed earlier in this cycle is skipped and
    /// stays due.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport {
            started_at: now.to_rfc3339(),
            runs: Vec::new(),
        };
        let mut succeeded: HashSet<String> = HashSet::new();

        for name in self.execution_order() {
            let Ok(task) = self.task(&name) else {
                continue;
            };
            if !task.is_due(now) {
                continue;
            }

            let outcome = if self.context.is_cancelled() {
                TaskOutcome::Skipped(SkipReason::ShuttingDown)
            } else if let Some(dep) = task.depends_on.iter().find(|d| !succeeded.contains(*d)) {
                debug!("Skipping {}: dependency {} did not succeed this cycle", name, dep);
                TaskOutcome::Skipped(SkipReason::DependencyUnmet)
            } else {
                self.execute_task(task, now).await
            };

            if outcome.is_success() {
                succeeded.insert(name.clone());
            }
            report.runs.push(TaskRun {
                task: name,
                outcome,
            });
        }

        if !report.runs.is_empty() {
            info!(
                "Cycle finished: {} due, {} executed, {} failed",
                report.runs.len(),
                report.executed().len(),
                report.failures()
            );
        }
        report
    }

    /// Run a task now regardless of its schedule.
    ///
    /// Dependencies count as met when their most recent execution succeeded.
    pub async fn run_task_now(&self, name: &str) -> Result<TaskOutcome, SchedulerError> {
        let task = self.task(name)?;

        if self.context.is_cancelled() {
            return Ok(TaskOutcome::Skipped(SkipReason::ShuttingDown));
        }
        if !task.runtime.lock().unwrap().enabled {
            return Ok(TaskOutcome::Skipped(SkipReason::Disabled));
        }
        for dep in &task.depends_on {
            let met = self
                .task(dep)
                .map(|d| d.last_execution_succeeded())
                .unwrap_or(false);
            if !met {
                debug!("Manual run of {} skipped: {} has not succeeded", name, dep);
                return Ok(TaskOutcome::Skipped(SkipReason::DependencyUnmet));
            }
        }

        info!("Running task {} on demand", name);
        Ok(self.execute_task(task, Utc::now()).await)
    }

    /// Execute a task's handler under the retry policy and attempt timeout,
    /// then record the result. `now` becomes the task's `last_run_at` unless
    /// the execution ends skipped (open circuit, shutdown).
    async fn execute_task(&self, task: &ScheduledTask, now: DateTime<Utc>) -> TaskOutcome {
        {
            let mut runtime = task.runtime.lock().unwrap();
            if runtime.running {
                return TaskOutcome::Skipped(SkipReason::AlreadyRunning);
            }
            runtime.running = true;
        }
        let _running = RunningGuard { task };

        let _exclusive = if task.exclusive {
            match self.exclusive_lock.try_lock() {
                Ok(guard) => Some(guard),
                Err(_) => {
                    debug!("Deferring {}: another exclusive task is running", task.name);
                    return TaskOutcome::Skipped(SkipReason::ExclusiveBusy);
                }
            }
        } else {
            None
        };

        metrics::set_task_running(&task.name, true);
        info!("Starting task: {}", task.name);
        let start_time = Instant::now();

        let ctx = self.context.for_execution();
        let ctx_ref = &ctx;
        let handler = task.handler.as_ref();
        let timeout = self.attempt_timeout;
        let result = self
            .retry
            .run(
                move || with_timeout(timeout, handler.execute(ctx_ref)),
                |e: &JobError| !matches!(e, JobError::CircuitOpen { .. }) && e.is_transient(),
            )
            .await;
        let elapsed = start_time.elapsed();

        let outcome = match result {
            Ok(result) if result.success => {
                info!("Task {} completed successfully in {:?}", task.name, elapsed);
                TaskOutcome::Succeeded(result)
            }
            Ok(result) => {
                warn!("Task {} reported failure after {:?}", task.name, elapsed);
                TaskOutcome::Failed(result)
            }
            Err(e) if matches!(e.inner(), JobError::CircuitOpen { .. }) => {
                warn!("Task {} deferred: {}", task.name, e.inner());
                TaskOutcome::Skipped(SkipReason::CircuitOpen)
            }
            Err(e) if matches!(e.inner(), JobError::Cancelled) => {
                info!("Task {} interrupted by shutdown after {:?}", task.name, elapsed);
                TaskOutcome::Skipped(SkipReason::Interrupted)
            }
            Err(e) => {
                error!("Task {} failed after {:?}: {}", task.name, elapsed, e);
                let mut result = TaskResult::failed(e.inner());
                if let Some(error) = result.error.as_mut() {
                    error.message = e.to_string();
                }
                TaskOutcome::Failed(result)
            }
        };

        {
            // Skipped executions leave the task due
            let mut runtime = task.runtime.lock().unwrap();
            match &outcome {
                TaskOutcome::Succeeded(_) => {
                    runtime.last_run_at = Some(now);
                    runtime.last_success_at = Some(now);
                    runtime.last_error = None;
                }
                TaskOutcome::Failed(result) => {
                    runtime.last_run_at = Some(now);
                    runtime.last_error = Some(result.error.clone().unwrap_or(TaskError {
                        class: crate::resilience::ErrorClass::Terminal,
                        message: "task reported failure".to_string(),
                    }));
                }
                TaskOutcome::Skipped(_) => {}
            }
        }

        let status_label = match &outcome {
            TaskOutcome::Succeeded(_) => "success",
            TaskOutcome::Failed(_) => "failure",
            TaskOutcome::Skipped(_) => "skipped",
        };
        metrics::record_task_execution(&task.name, status_label, elapsed);
        outcome
    }

    /// Enable or disable a task. Disabling drops a pending debounced run.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), SchedulerError> {
        let task = self.task(name)?;
        task.runtime.lock().unwrap().enabled = enabled;
        if !enabled {
            if let Some(debouncer) = self.context.debouncer() {
                debouncer.cancel(name);
            }
        }
        info!(
            "Task {} {}",
            name,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    pub fn get_status(&self) -> Vec<TaskStatus> {
        let now = Utc::now();
        self.tasks
            .iter()
            .map(|task| {
                let runtime = task.runtime.lock().unwrap();
                let next_due_at = if !runtime.enabled {
                    None
                } else {
                    Some(match runtime.last_run_at {
                        Some(last) => last + task.interval_chrono(),
                        None => now,
                    })
                };
                TaskStatus {
                    name: task.name.clone(),
                    description: task.description.clone(),
                    enabled: runtime.enabled,
                    interval_secs: task.interval.as_secs(),
                    exclusive: task.exclusive,
                    depends_on: task.depends_on.clone(),
                    running: runtime.running,
                    last_run_at: runtime.last_run_at.map(|t| t.to_rfc3339()),
                    last_success_at: runtime.last_success_at.map(|t| t.to_rfc3339()),
                    last_error: runtime.last_error.clone(),
                    next_due_at: next_due_at.map(|t| t.to_rfc3339()),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::Debouncer;
    use crate::library_store::MemoryLibraryStore;
    use crate::resilience::BreakerRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    /// Records the order in which handlers ran.
    type Journal = Arc<Mutex<Vec<String>>>;

    struct TestJob {
        name: &'static str,
        journal: Journal,
        executions: AtomicUsize,
        should_fail: AtomicBool,
        transient: bool,
        delay: Option<Duration>,
    }

    impl TestJob {
        fn new(name: &'static str, journal: &Journal) -> Arc<Self> {
            Arc::new(Self {
                name,
                journal: journal.clone(),
                executions: AtomicUsize::new(0),
                should_fail: AtomicBool::new(false),
                transient: false,
                delay: None,
            })
        }

        fn slow(name: &'static str, journal: &Journal, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name,
                journal: journal.clone(),
                executions: AtomicUsize::new(0),
                should_fail: AtomicBool::new(false),
                transient: false,
                delay: Some(delay),
            })
        }

        fn flaky(name: &'static str, journal: &Journal) -> Arc<Self> {
            Arc::new(Self {
                name,
                journal: journal.clone(),
                executions: AtomicUsize::new(0),
                should_fail: AtomicBool::new(true),
                transient: true,
                delay: None,
            })
        }

        fn count(&self) -> usize {
            self.executions.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackgroundJob for TestJob {
        async fn execute(&self, _ctx: &JobContext) -> Result<TaskResult, JobError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            self.journal.lock().unwrap().push(self.name.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.should_fail.load(Ordering::SeqCst) {
                if self.transient {
                    return Err(JobError::transient("upstream unavailable"));
                }
                return Err(JobError::terminal("Test failure"));
            }
            Ok(TaskResult::ok().with_stat("runs", 1u32))
        }
    }

    /// Always fails with the error `make` builds.
    struct FailingJob {
        make: fn() -> JobError,
        executions: AtomicUsize,
    }

    impl FailingJob {
        fn new(make: fn() -> JobError) -> Arc<Self> {
            Arc::new(Self {
                make,
                executions: AtomicUsize::new(0),
            })
        }

        fn count(&self) -> usize {
            self.executions.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackgroundJob for FailingJob {
        async fn execute(&self, _ctx: &JobContext) -> Result<TaskResult, JobError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            Err((self.make)())
        }
    }

    fn context() -> JobContext {
        JobContext::new(
            CancellationToken::new(),
            Arc::new(MemoryLibraryStore::new()),
            Arc::new(BreakerRegistry::default()),
        )
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
            jitter: false,
        }
    }

    fn scheduler() -> TaskScheduler {
        TaskScheduler::new(context(), retry(), Duration::from_secs(5))
    }

    const HOUR: Duration = Duration::from_secs(3600);

    fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let journal = journal();
        let mut scheduler = scheduler();
        scheduler
            .register(TaskRegistration::new("a", HOUR, TestJob::new("a", &journal)))
            .unwrap();
        let err = scheduler
            .register(TaskRegistration::new("a", HOUR, TestJob::new("a", &journal)))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateTask(name) if name == "a"));
        assert_eq!(scheduler.names(), vec!["a"]);
    }

    #[test]
    fn test_cycle_rejected_without_mutation() {
        let journal = journal();
        let mut scheduler = scheduler();
        scheduler
            .register(TaskRegistration::new("a", HOUR, TestJob::new("a", &journal)).depends_on(["b"]))
            .unwrap();
        let err = scheduler
            .register(TaskRegistration::new("b", HOUR, TestJob::new("b", &journal)).depends_on(["a"]))
            .unwrap_err();
        match err {
            SchedulerError::CyclicDependency { task, cycle } => {
                assert_eq!(task, "b");
                assert_eq!(cycle.first(), cycle.last());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(scheduler.names(), vec!["a"]);
        assert!(!scheduler.contains("b"));

        let self_loop = scheduler
            .register(TaskRegistration::new("c", HOUR, TestJob::new("c", &journal)).depends_on(["c"]));
        assert!(matches!(self_loop, Err(SchedulerError::CyclicDependency { .. })));
    }

    #[test]
    fn test_validate_reports_unknown_dependencies() {
        let journal = journal();
        let mut scheduler = scheduler();
        scheduler
            .register(TaskRegistration::new("b", HOUR, TestJob::new("b", &journal)).depends_on(["a"]))
            .unwrap();
        assert!(matches!(
            scheduler.validate(),
            Err(SchedulerError::UnknownDependency { task, dependency }) if task == "b" && dependency == "a"
        ));

        // Registration order does not matter
        scheduler
            .register(TaskRegistration::new("a", HOUR, TestJob::new("a", &journal)))
            .unwrap();
        assert!(scheduler.validate().is_ok());
        assert_eq!(scheduler.execution_order(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_dependents_run_after_dependency_in_same_cycle() {
        let journal = journal();
        let (a, b, c) = (
            TestJob::new("A", &journal),
            TestJob::new("B", &journal),
            TestJob::new("C", &journal),
        );
        let mut scheduler = scheduler();
        scheduler
            .register(TaskRegistration::new("B", HOUR, b.clone()).depends_on(["A"]))
            .unwrap();
        scheduler
            .register(TaskRegistration::new("C", HOUR, c.clone()).depends_on(["A"]))
            .unwrap();
        scheduler
            .register(TaskRegistration::new("A", HOUR, a.clone()))
            .unwrap();

        let report = scheduler.run_cycle_at(Utc::now()).await;
        assert_eq!(*journal.lock().unwrap(), vec!["A", "B", "C"]);
        assert_eq!(report.executed(), vec!["A", "B", "C"]);
        assert!(report.outcome("B").unwrap().is_success());
        assert!(report.outcome("C").unwrap().is_success());
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependents() {
        let journal = journal();
        let a = TestJob::flaky("A", &journal);
        let b = TestJob::new("B", &journal);
        let c = TestJob::new("C", &journal);
        let mut scheduler = scheduler();
        scheduler.register(TaskRegistration::new("A", HOUR, a.clone())).unwrap();
        scheduler
            .register(TaskRegistration::new("B", HOUR, b.clone()).depends_on(["A"]))
            .unwrap();
        scheduler
            .register(TaskRegistration::new("C", HOUR, c.clone()).depends_on(["A"]))
            .unwrap();

        let now = Utc::now();
        let report = scheduler.run_cycle_at(now).await;

        // Transient failure retried up to max_attempts
        assert_eq!(a.count(), 3);
        match report.outcome("A").unwrap() {
            TaskOutcome::Failed(result) => {
                let error = result.error.as_ref().unwrap();
                assert!(error.message.contains("Retries exhausted after 3 attempts"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            report.outcome("B").unwrap().skip_reason(),
            Some(SkipReason::DependencyUnmet)
        );
        assert_eq!(
            report.outcome("C").unwrap().skip_reason(),
            Some(SkipReason::DependencyUnmet)
        );
        assert_eq!(b.count() + c.count(), 0);

        let status = scheduler.get_status();
        let status_of = |name: &str| status.iter().find(|s| s.name == name).unwrap().clone();
        assert_eq!(status_of("A").last_run_at, Some(now.to_rfc3339()));
        assert!(status_of("A").last_error.is_some());
        assert!(status_of("A").last_success_at.is_none());
        assert!(status_of("B").last_run_at.is_none());
        assert!(status_of("C").last_run_at.is_none());

        // A recovers: skipped tasks are still due and run next cycle
        a.should_fail.store(false, Ordering::SeqCst);
        let later = now + chrono::Duration::hours(2);
        let report = scheduler.run_cycle_at(later).await;
        assert_eq!(report.executed(), vec!["A", "B", "C"]);
        assert!(scheduler.get_status()[0].last_error.is_none());
    }

    #[tokio::test]
    async fn test_terminal_failure_is_not_retried() {
        let journal = journal();
        let a = TestJob::new("A", &journal);
        a.should_fail.store(true, Ordering::SeqCst);
        let mut scheduler = scheduler();
        scheduler.register(TaskRegistration::new("A", HOUR, a.clone())).unwrap();

        let report = scheduler.run_cycle_at(Utc::now()).await;
        assert_eq!(a.count(), 1);
        let result = report.outcome("A").unwrap().result().unwrap();
        assert!(!result.success);
        assert_eq!(
            result.error.as_ref().unwrap().class,
            crate::resilience::ErrorClass::Terminal
        );
    }

    #[tokio::test]
    async fn test_only_due_tasks_run() {
        let journal = journal();
        let fast = TestJob::new("fast", &journal);
        let slow = TestJob::new("slow", &journal);
        let mut scheduler = scheduler();
        scheduler
            .register(TaskRegistration::new("fast", Duration::from_secs(60), fast.clone()))
            .unwrap();
        scheduler
            .register(TaskRegistration::new("slow", HOUR, slow.clone()))
            .unwrap();
        scheduler
            .register(TaskRegistration::new("off", Duration::from_secs(1), TestJob::new("off", &journal)).disabled())
            .unwrap();

        let t0 = Utc::now();
        let first = scheduler.run_cycle_at(t0).await;
        assert_eq!(first.executed(), vec!["fast", "slow"]);

        let second = scheduler.run_cycle_at(t0 + chrono::Duration::seconds(30)).await;
        assert!(second.runs.is_empty());

        let third = scheduler.run_cycle_at(t0 + chrono::Duration::seconds(61)).await;
        assert_eq!(third.executed(), vec!["fast"]);
        assert_eq!(fast.count(), 2);
        assert_eq!(slow.count(), 1);
    }

    #[tokio::test]
    async fn test_dependency_not_due_this_cycle_blocks_dependent() {
        let journal = journal();
        let mut scheduler = scheduler();
        scheduler
            .register(TaskRegistration::new("sync", HOUR, TestJob::new("sync", &journal)))
            .unwrap();
        scheduler
            .register(
                TaskRegistration::new("merge", Duration::from_secs(60), TestJob::new("merge", &journal))
                    .depends_on(["sync"]),
            )
            .unwrap();

        let t0 = Utc::now();
        scheduler.run_cycle_at(t0).await;
        let report = scheduler.run_cycle_at(t0 + chrono::Duration::seconds(120)).await;
        assert_eq!(
            report.outcome("merge").unwrap().skip_reason(),
            Some(SkipReason::DependencyUnmet)
        );
        assert!(report.outcome("sync").is_none());
    }

    #[tokio::test]
    async fn test_run_task_now_gates_on_last_execution() {
        let journal = journal();
        let a = TestJob::new("A", &journal);
        let b = TestJob::new("B", &journal);
        let mut scheduler = scheduler();
        scheduler.register(TaskRegistration::new("A", HOUR, a.clone())).unwrap();
        scheduler
            .register(TaskRegistration::new("B", HOUR, b.clone()).depends_on(["A"]))
            .unwrap();

        let outcome = scheduler.run_task_now("B").await.unwrap();
        assert_eq!(outcome.skip_reason(), Some(SkipReason::DependencyUnmet));

        assert!(scheduler.run_task_now("A").await.unwrap().is_success());
        assert!(scheduler.run_task_now("B").await.unwrap().is_success());
        // Manual runs bypass the due check
        assert!(scheduler.run_task_now("B").await.unwrap().is_success());
        assert_eq!(b.count(), 2);

        a.should_fail.store(true, Ordering::SeqCst);
        assert!(!scheduler.run_task_now("A").await.unwrap().is_success());
        let outcome = scheduler.run_task_now("B").await.unwrap();
        assert_eq!(outcome.skip_reason(), Some(SkipReason::DependencyUnmet));

        assert!(matches!(
            scheduler.run_task_now("missing").await,
            Err(SchedulerError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_task_is_skipped_and_not_due() {
        let journal = journal();
        let a = TestJob::new("A", &journal);
        let mut scheduler = scheduler();
        scheduler.register(TaskRegistration::new("A", HOUR, a.clone())).unwrap();

        scheduler.set_enabled("A", false).unwrap();
        assert!(scheduler.run_cycle_at(Utc::now()).await.runs.is_empty());
        assert_eq!(
            scheduler.run_task_now("A").await.unwrap().skip_reason(),
            Some(SkipReason::Disabled)
        );
        assert!(scheduler.get_status()[0].next_due_at.is_none());

        scheduler.set_enabled("A", true).unwrap();
        assert!(scheduler.run_task_now("A").await.unwrap().is_success());
        assert!(scheduler.set_enabled("missing", true).is_err());
    }

    #[tokio::test]
    async fn test_disabling_cancels_debounced_trigger() {
        let journal = journal();
        let (debouncer, _rx) = Debouncer::new(Duration::from_secs(5));
        let ctx = context().with_debouncer(debouncer.clone());
        let mut scheduler = TaskScheduler::new(ctx, retry(), Duration::from_secs(5));
        scheduler
            .register(TaskRegistration::new("A", HOUR, TestJob::new("A", &journal)))
            .unwrap();

        debouncer.trigger("A");
        assert!(debouncer.is_pending("A"));
        scheduler.set_enabled("A", false).unwrap();
        assert!(!debouncer.is_pending("A"));
    }

    #[tokio::test]
    async fn test_exclusive_tasks_do_not_overlap() {
        let journal = journal();
        let slow = TestJob::slow("slow", &journal, Duration::from_millis(200));
        let other = TestJob::new("other", &journal);
        let mut scheduler = scheduler();
        scheduler
            .register(TaskRegistration::new("slow", HOUR, slow.clone()).exclusive())
            .unwrap();
        scheduler
            .register(TaskRegistration::new("other", HOUR, other.clone()).exclusive())
            .unwrap();
        let scheduler = Arc::new(scheduler);

        let background = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run_task_now("slow").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outcome = scheduler.run_task_now("other").await.unwrap();
        assert_eq!(outcome.skip_reason(), Some(SkipReason::ExclusiveBusy));
        let again = scheduler.run_task_now("slow").await.unwrap();
        assert_eq!(again.skip_reason(), Some(SkipReason::AlreadyRunning));

        assert!(background.await.unwrap().unwrap().is_success());
        assert_eq!(other.count(), 0);
        assert_eq!(slow.count(), 1);

        // Deferred task is still due and runs once the lock is free
        let report = scheduler.run_cycle_at(Utc::now()).await;
        assert_eq!(report.executed(), vec!["other"]);
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_transient() {
        let journal = journal();
        let hung = TestJob::slow("hung", &journal, Duration::from_secs(60));
        let mut scheduler = TaskScheduler::new(context(), retry(), Duration::from_millis(20));
        scheduler.register(TaskRegistration::new("hung", HOUR, hung.clone())).unwrap();

        let report = scheduler.run_cycle_at(Utc::now()).await;
        assert_eq!(hung.count(), 3);
        let error = report.outcome("hung").unwrap().result().unwrap().error.clone().unwrap();
        assert_eq!(error.class, crate::resilience::ErrorClass::Transient);
        assert!(!scheduler.get_status()[0].running);
    }

    #[tokio::test]
    async fn test_shutdown_skips_remaining_tasks() {
        let journal = journal();
        let ctx = context();
        let token = ctx.cancellation_token.clone();
        let mut scheduler = TaskScheduler::new(ctx, retry(), Duration::from_secs(5));
        scheduler
            .register(TaskRegistration::new("A", HOUR, TestJob::new("A", &journal)))
            .unwrap();

        token.cancel();
        let report = scheduler.run_cycle_at(Utc::now()).await;
        assert_eq!(
            report.outcome("A").unwrap().skip_reason(),
            Some(SkipReason::ShuttingDown)
        );
        assert!(journal.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_circuit_defers_without_retrying() {
        let job = FailingJob::new(|| JobError::CircuitOpen {
            dependency: "downloader".to_string(),
        });
        let journal = journal();
        let dependent = TestJob::new("B", &journal);
        let mut scheduler = scheduler();
        scheduler.register(TaskRegistration::new("A", HOUR, job.clone())).unwrap();
        scheduler
            .register(TaskRegistration::new("B", HOUR, dependent.clone()).depends_on(["A"]))
            .unwrap();

        let now = Utc::now();
        let report = scheduler.run_cycle_at(now).await;
        assert_eq!(job.count(), 1);
        assert_eq!(
            report.outcome("A").unwrap().skip_reason(),
            Some(SkipReason::CircuitOpen)
        );
        assert_eq!(
            report.outcome("B").unwrap().skip_reason(),
            Some(SkipReason::DependencyUnmet)
        );
        assert_eq!(report.failures(), 0);

        let status = scheduler.get_status();
        assert!(status[0].last_error.is_none());
        assert!(status[0].last_run_at.is_none());

        // Still due on the next tick
        let report = scheduler
            .run_cycle_at(now + chrono::Duration::seconds(60))
            .await;
        assert_eq!(job.count(), 2);
        assert!(report.outcome("A").is_some());
    }

    #[tokio::test]
    async fn test_cancelled_handler_is_recorded_as_interrupted() {
        let job = FailingJob::new(|| JobError::Cancelled);
        let mut scheduler = scheduler();
        scheduler.register(TaskRegistration::new("A", HOUR, job.clone())).unwrap();

        let report = scheduler.run_cycle_at(Utc::now()).await;
        assert_eq!(job.count(), 1);
        assert_eq!(
            report.outcome("A").unwrap().skip_reason(),
            Some(SkipReason::Interrupted)
        );

        let status = &scheduler.get_status()[0];
        assert!(status.last_error.is_none());
        assert!(status.last_run_at.is_none());
        assert!(status.last_success_at.is_none());
    }

    #[tokio::test]
    async fn test_dependent_cadence_follows_dependency_over_many_cycles() {
        let journal = journal();
        let minutes = |m: u64| Duration::from_secs(m * 60);

        // Dependent interval shorter than its dependency's
        let slow_dep = TestJob::new("slow_dep", &journal);
        let eager = TestJob::new("eager", &journal);
        // Dependent interval a multiple of its dependency's
        let fast_dep = TestJob::new("fast_dep", &journal);
        let patient = TestJob::new("patient", &journal);

        let mut scheduler = scheduler();
        scheduler
            .register(TaskRegistration::new("slow_dep", minutes(10), slow_dep.clone()))
            .unwrap();
        scheduler
            .register(TaskRegistration::new("eager", minutes(5), eager.clone()).depends_on(["slow_dep"]))
            .unwrap();
        scheduler
            .register(TaskRegistration::new("fast_dep", minutes(5), fast_dep.clone()))
            .unwrap();
        scheduler
            .register(TaskRegistration::new("patient", minutes(10), patient.clone()).depends_on(["fast_dep"]))
            .unwrap();

        let t0 = Utc::now();
        let mut eager_skips = 0;
        for tick in 0..=30 {
            let report = scheduler
                .run_cycle_at(t0 + chrono::Duration::minutes(tick))
                .await;
            if report.outcome("eager").and_then(|o| o.skip_reason()) == Some(SkipReason::DependencyUnmet) {
                eager_skips += 1;
            }
        }

        // Runs at minutes 0, 10, 20 and 30 only
        assert_eq!(slow_dep.count(), 4);
        assert_eq!(eager.count(), 4);
        // Due at 5..=9, 15..=19 and 25..=29 but gated every time
        assert_eq!(eager_skips, 15);

        assert_eq!(fast_dep.count(), 7);
        assert_eq!(patient.count(), 4);
    }
}
