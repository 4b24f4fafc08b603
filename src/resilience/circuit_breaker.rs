//! Per-dependency circuit breakers.
//!
//! A breaker trips after a run of consecutive transient failures and then
//! fails fast until its open timeout elapses, after which a single probe call
//! is admitted to decide whether to close again.

use super::classify::{Classify, ErrorClass};
use crate::config::CircuitBreakerSettings;
use crate::server::metrics;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is allowed.
    pub open_timeout: Duration,
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            open_timeout: Duration::from_secs(settings.open_timeout_secs),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&CircuitBreakerSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug)]
pub enum CircuitError<E> {
    /// The call was rejected without invoking the operation.
    Open {
        dependency: String,
        retry_in: Duration,
    },
    /// The operation ran and failed.
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitError::Open {
                dependency,
                retry_in,
            } => write!(
                f,
                "Circuit open for {} (retry in {}s)",
                dependency,
                retry_in.as_secs()
            ),
            CircuitError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CircuitError::Open { .. } => None,
            CircuitError::Inner(e) => Some(e),
        }
    }
}

impl<E: Classify> Classify for CircuitError<E> {
    fn classify(&self) -> ErrorClass {
        match self {
            // The dependency may be back by the next attempt.
            CircuitError::Open { .. } => ErrorClass::Transient,
            CircuitError::Inner(e) => e.classify(),
        }
    }
}

/// Point-in-time view of a breaker, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_until: Option<String>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_until: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Releases the half-open probe slot if the probe future is dropped early.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.inner.lock().unwrap();
            inner.probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        metrics::set_circuit_state(&name, CircuitState::Closed);
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_until: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, accounting for an elapsed open timeout.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Run `op` through the breaker.
    ///
    /// Transient failures (as decided by `is_transient`) count towards the
    /// threshold. Any other outcome proves the dependency reachable.
    pub async fn call<T, E, F, Fut, C>(&self, op: F, is_transient: C) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        let is_probe = self.admit()?;
        let mut guard = ProbeGuard {
            breaker: self,
            armed: is_probe,
        };

        let result = op().await;
        guard.armed = false;

        match &result {
            Ok(_) => self.record_success(),
            Err(e) if is_transient(e) => self.record_failure(),
            Err(_) => self.record_success(),
        }
        result.map_err(CircuitError::Inner)
    }

    /// Same as [`CircuitBreaker::call`], classifying errors through [`Classify`].
    pub async fn call_classified<T, E, F, Fut>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        self.call(op, |e: &E| e.is_transient()).await
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner, now);
        let opened_until = match (inner.state, inner.opened_until) {
            (CircuitState::Open, Some(until)) => {
                let remaining = until.saturating_duration_since(now);
                chrono::Duration::from_std(remaining)
                    .ok()
                    .map(|d| (chrono::Utc::now() + d).to_rfc3339())
            }
            _ => None,
        };
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_until,
        }
    }

    /// Returns whether the admitted call is the half-open probe.
    fn admit<E>(&self) -> Result<bool, CircuitError<E>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => Err(CircuitError::Open {
                dependency: self.name.clone(),
                retry_in: inner
                    .opened_until
                    .map(|until| until.saturating_duration_since(now))
                    .unwrap_or_default(),
            }),
            CircuitState::HalfOpen if inner.probe_in_flight => Err(CircuitError::Open {
                dependency: self.name.clone(),
                retry_in: Duration::ZERO,
            }),
            CircuitState::HalfOpen => {
                inner.probe_in_flight = true;
                Ok(true)
            }
        }
    }

    fn refresh(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state == CircuitState::Open {
            if let Some(until) = inner.opened_until {
                if now >= until {
                    info!("Circuit for {} is half-open, admitting a probe", self.name);
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = false;
                    metrics::set_circuit_state(&self.name, CircuitState::HalfOpen);
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != CircuitState::Closed {
            info!("Circuit for {} closed", self.name);
            metrics::set_circuit_state(&self.name, CircuitState::Closed);
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_until = None;
        inner.probe_in_flight = false;
    }

    fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.probe_in_flight = false;

        let should_open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open {
            warn!(
                "Circuit for {} opened after {} consecutive failures, cooling down for {:?}",
                self.name, inner.consecutive_failures, self.config.open_timeout
            );
            inner.state = CircuitState::Open;
            inner.opened_until = Some(now + self.config.open_timeout);
            metrics::set_circuit_state(&self.name, CircuitState::Open);
        }
    }
}

/// Owns one breaker per named external dependency.
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Get the breaker for `name`, creating it on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    /// Snapshots of every breaker, ordered by name.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.lock().unwrap().values().cloned().collect();
        breakers.iter().map(|b| b.snapshot()).collect()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Unreachable,
        BadRequest,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl Classify for TestError {
        fn classify(&self) -> ErrorClass {
            match self {
                TestError::Unreachable => ErrorClass::Transient,
                TestError::BadRequest => ErrorClass::Terminal,
            }
        }
    }

    fn breaker(threshold: u32, timeout_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test_dependency",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                open_timeout: Duration::from_secs(timeout_secs),
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), CircuitError<TestError>> {
        cb.call_classified(|| async { Err(TestError::Unreachable) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), CircuitError<TestError>> {
        cb.call_classified(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker(3, 60);

        for _ in 0..2 {
            assert!(matches!(fail(&cb).await, Err(CircuitError::Inner(_))));
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert!(matches!(fail(&cb).await, Err(CircuitError::Inner(_))));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.snapshot().consecutive_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast_until_timeout() {
        let cb = breaker(3, 60);
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }

        let invoked = AtomicU32::new(0);
        for _ in 0..5 {
            let result: Result<(), CircuitError<TestError>> = cb
                .call_classified(|| async {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            match result {
                Err(CircuitError::Open {
                    dependency,
                    retry_in,
                }) => {
                    assert_eq!(dependency, "test_dependency");
                    assert!(retry_in <= Duration::from_secs(60));
                }
                other => panic!("expected open circuit, got {:?}", other),
            }
        }
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(succeed(&cb).await.unwrap_err().is_open());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_timeout() {
        let cb = breaker(1, 30);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(matches!(fail(&cb).await, Err(CircuitError::Inner(_))));
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(succeed(&cb).await.unwrap_err().is_open());
        tokio::time::advance(Duration::from_secs(1)).await;
        succeed(&cb).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let cb = Arc::new(breaker(1, 10));
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_cb = cb.clone();
        let probe = tokio::spawn(async move {
            probe_cb
                .call_classified(|| async move {
                    let _ = release_rx.await;
                    Ok::<(), TestError>(())
                })
                .await
        });
        tokio::task::yield_now().await;

        // The probe is in flight, concurrent callers are rejected.
        assert!(succeed(&cb).await.unwrap_err().is_open());

        release_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_errors_do_not_count() {
        let cb = breaker(2, 60);
        for _ in 0..5 {
            let result: Result<(), _> = cb
                .call_classified(|| async { Err(TestError::BadRequest) })
                .await;
            assert!(matches!(
                result,
                Err(CircuitError::Inner(TestError::BadRequest))
            ));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 60);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_error_is_transient() {
        let err: CircuitError<TestError> = CircuitError::Open {
            dependency: "x".to_string(),
            retry_in: Duration::from_secs(5),
        };
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "Circuit open for x (retry in 5s)");
        assert!(!CircuitError::Inner(TestError::BadRequest).is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_isolates_dependencies() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_timeout: Duration::from_secs(60),
        });

        let a = registry.get("source_a");
        let _ = fail(&a).await;

        assert_eq!(registry.get("source_a").state(), CircuitState::Open);
        let b = registry.get("source_b");
        succeed(&b).await.unwrap();

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].name, "source_a");
        assert_eq!(snapshots[0].state, CircuitState::Open);
        assert!(snapshots[0].opened_until.is_some());
        assert_eq!(snapshots[1].name, "source_b");
        assert_eq!(snapshots[1].state, CircuitState::Closed);
        assert!(snapshots[1].opened_until.is_none());
    }
}
