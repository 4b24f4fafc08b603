//! Resilience primitives for calls that cross a process boundary.
//!
//! Everything here is driven by a single error classification
//! ([`ErrorClass`]) so that the retry policy, the circuit breakers and the
//! task scheduler all agree on what "worth retrying" means.

mod circuit_breaker;
mod classify;
mod retry_policy;

pub use circuit_breaker::{
    BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitSnapshot,
    CircuitState,
};
pub use classify::{with_timeout, Classify, ErrorClass};
pub use retry_policy::{RetryError, RetryPolicy};
