use super::debouncer::Debouncer;
use crate::library_store::LibraryStore;
use crate::resilience::{BreakerRegistry, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Context provided to jobs during execution.
///
/// Contains references to shared resources and a cancellation token
/// for graceful shutdown handling.
#[derive(Clone)]
pub struct JobContext {
    /// Token to check for cancellation/shutdown requests.
    pub cancellation_token: CancellationToken,

    /// Access to the canonical library.
    pub store: Arc<dyn LibraryStore>,

    /// One circuit breaker per external dependency.
    pub breakers: Arc<BreakerRegistry>,

    /// Retry policy for units of work inside a job (a single record, a
    /// single download), as opposed to the whole execution.
    pub retry: RetryPolicy,

    /// Timeout for a single call crossing a process boundary.
    pub call_timeout: Duration,

    debouncer: Option<Debouncer>,
}

impl JobContext {
    pub fn new(
        cancellation_token: CancellationToken,
        store: Arc<dyn LibraryStore>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            cancellation_token,
            store,
            breakers,
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(300),
            debouncer: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_debouncer(mut self, debouncer: Debouncer) -> Self {
        self.debouncer = Some(debouncer);
        self
    }

    /// Copy of this context with its own child cancellation token.
    pub fn for_execution(&self) -> Self {
        let mut ctx = self.clone();
        ctx.cancellation_token = self.cancellation_token.child_token();
        ctx
    }

    /// Check if cancellation has been requested.
    ///
    /// Jobs should check this between units of work and stop early, leaving
    /// the library consistent.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn debouncer(&self) -> Option<&Debouncer> {
        self.debouncer.as_ref()
    }

    /// Ask for a (debounced) run of another task. Returns false when no
    /// debouncer is wired.
    pub fn request_run(&self, task: &str) -> bool {
        match &self.debouncer {
            Some(debouncer) => {
                debouncer.trigger(task);
                true
            }
            None => false,
        }
    }
}
