use std::time::Duration;

use thiserror::Error;

use crate::http::BoxError;

/// Failures talking to the shared store.
///
/// These never reach callers of the limiter or coordinator: the
/// [`SharedStore`](crate::store::SharedStore) answers from local state
/// instead and logs the degradation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupted value at '{key}': {reason}")]
    Corrupted { key: String, reason: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// A caller exceeded its rate limit.
#[derive(Debug, Clone, Error)]
#[error("rate limit exceeded for '{key}': {limit} requests, retry in {retry_after}s")]
pub struct RateLimitExceeded {
    pub key: String,
    pub limit: u64,
    pub retry_after: u64,
}

/// The breaker for a dependency is open (or its half-open probe quota is
/// used up) and the wrapped call was not attempted.
#[derive(Debug, Clone, Error)]
#[error("circuit breaker '{name}' is open")]
pub struct CircuitOpenError {
    pub name: String,
    /// Time left before the breaker will admit a probe, when known.
    pub retry_after: Option<Duration>,
}

/// Outcome of a call routed through a circuit breaker.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(#[from] CircuitOpenError),

    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open(_))
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock on '{resource}'")]
    AcquisitionTimeout { resource: String, waited: Duration },
}

/// Errors from the bounded task executor.
///
/// A [`Timeout`](TaskError::Timeout) means the outcome is undetermined: the
/// work may still be running and may still complete its side effects.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task exceeded its deadline of {0:?}")]
    Timeout(Duration),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task failed: {0}")]
    Failed(BoxError),

    #[error("executor is shut down")]
    ShutDown,
}

impl TaskError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout(_))
    }
}

/// A batch run aborted on its first failing task.
#[derive(Debug, Error)]
#[error("task '{task}' failed: {source}")]
pub struct BatchError {
    pub task: String,
    #[source]
    pub source: TaskError,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out after {0:?} waiting for a pooled resource")]
    Timeout(Duration),

    #[error("pool is closed")]
    Closed,

    #[error("failed to create resource: {0}")]
    Create(BoxError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {reason}")]
    Env { var: String, reason: String },
}
