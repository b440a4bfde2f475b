use thiserror::Error;

/// Errors delivered to the caller of `acquire`.
///
/// Releasing an unknown lease and running out of evictable models are not
/// errors: the first is a no-op, the second leaves the request queued.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedError {
    #[error("resource acquire timed out after {waited_ms}ms")]
    AcquireTimeout { waited_ms: u64 },
    #[error("request declares {requested_mb}MB, above the hard limit of {limit_mb}MB")]
    HardVramLimitExceeded { requested_mb: u64, limit_mb: u64 },
    #[error("scheduler is not running")]
    SchedulerClosed,
}

impl SchedError {
    /// Worth retrying later, as opposed to shrinking the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedError::AcquireTimeout { .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
}
