use std::time::Duration;

/// Error taxonomy for the orchestration core.
///
/// Every variant is classified by [`OrchestratorError::is_retryable`] so the retry
/// combinator in `queue_bus::retry` and the worker bodies in `scheduler` can decide
/// whether to back off and try again or fail the task/call immediately.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("config error: {0}")]
    Config(String),

    #[error("task store error: {0}")]
    TaskStore(#[from] rusqlite::Error),

    #[error("kv store error: {0}")]
    KvStore(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("claim conflict: task already held by another instance")]
    ClaimConflict,

    #[error("transient network error: {0}")]
    Transient(String),

    #[error("non-retryable remote error ({status}): {message}")]
    NonRetryableRemote { status: u16, message: String },

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("circuit breaker open for {destination}")]
    CircuitOpen { destination: String },

    #[error("retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: usize, last_error: String },

    #[error("buffer overflow: dropped {dropped} entries")]
    BufferOverflow { dropped: usize },

    #[error("cancelled")]
    Cancelled,

    #[error("collaborator error: {0}")]
    Collaborator(String),
}

impl OrchestratorError {
    /// Whether a retry combinator should attempt this operation again.
    ///
    /// Validation, signature, claim-conflict, and non-retryable-remote errors are
    /// definite: retrying them would reproduce the same failure. Everything else
    /// (transient network conditions, pool exhaustion, serialization hiccups caused
    /// by a torn write) is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            OrchestratorError::Validation(_)
                | OrchestratorError::SignatureInvalid
                | OrchestratorError::ClaimConflict
                | OrchestratorError::NonRetryableRemote { .. }
                | OrchestratorError::Cancelled
                | OrchestratorError::NotFound(_)
        )
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        OrchestratorError::Config(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        OrchestratorError::Validation(msg.into())
    }

    pub fn transient<S: Into<String>>(msg: S) -> Self {
        OrchestratorError::Transient(msg.into())
    }
}

/// Suggested wait before the next attempt, used by callers that don't go through
/// the shared retry combinator (e.g. a caller reporting `RetryExhausted` upstream).
pub fn backoff_hint(attempt: usize) -> Duration {
    Duration::from_millis(500u64.saturating_mul(1 << attempt.min(6)))
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
