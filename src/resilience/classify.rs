use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::error::Elapsed;

/// Whether retrying an operation that produced an error can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network timeout, lock contention, rate limiting, connection refused.
    Transient,
    /// Malformed data, validation failure, structural problems.
    Terminal,
}

impl ErrorClass {
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorClass::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Terminal => "terminal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can tell whether they are worth retrying.
pub trait Classify {
    fn classify(&self) -> ErrorClass;

    fn is_transient(&self) -> bool {
        self.classify().is_transient()
    }
}

/// Await `fut` for at most `limit`.
///
/// An elapsed deadline is converted into the caller's error type, which is
/// expected to classify it as transient.
pub async fn with_timeout<T, E, F>(limit: Duration, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<Elapsed>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(elapsed) => Err(E::from(elapsed)),
    }
}
