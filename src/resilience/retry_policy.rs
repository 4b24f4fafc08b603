//! Retry policy for fallible async operations.
//!
//! Implements exponential backoff with configurable parameters and
//! multiplicative jitter so that tasks failing together do not retry together.

use super::classify::Classify;
use crate::config::RetrySettings;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy implementing exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Cap for exponential growth.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_factor: f64,
    /// Whether delays are multiplied by a random factor in [0.5, 1.5].
    pub jitter: bool,
}

/// Failure of an operation run under a [`RetryPolicy`].
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation failed with a non-transient error. No retry was consumed.
    Terminal(E),
    /// Every attempt failed with a transient error.
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    /// The error produced by the last attempt.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Terminal(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }

    pub fn inner(&self) -> &E {
        match self {
            RetryError::Terminal(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::Terminal(e) => write!(f, "{}", e),
            RetryError::Exhausted { attempts, last } => {
                write!(f, "Retries exhausted after {} attempts: {}", attempts, last)
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner())
    }
}

impl RetryPolicy {
    /// Create a new RetryPolicy from configuration settings.
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_factor: settings.backoff_factor,
            jitter: true,
        }
    }

    /// A policy that runs the operation exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based), before jitter.
    ///
    /// `base_delay * backoff_factor^(attempt-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let factor: f64 = rand::rng().random_range(0.5..=1.5);
        delay.mul_f64(factor)
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out.
    pub async fn run<T, E, F, Fut, C>(&self, mut op: F, is_transient: C) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !is_transient(&e) => return Err(RetryError::Terminal(e)),
                Err(e) => {
                    if attempt >= self.max_attempts {
                        warn!("Giving up after {} attempts: {}", attempt, e);
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last: e,
                        });
                    }
                    let delay = self.jittered(self.backoff(attempt));
                    debug!(
                        "Attempt {}/{} failed ({}), retrying in {:?}",
                        attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Same as [`RetryPolicy::run`], classifying errors through [`Classify`].
    pub async fn run_classified<T, E, F, Fut>(&self, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::fmt::Display,
    {
        self.run(op, |e: &E| e.is_transient()).await
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}
