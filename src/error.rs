//! Crate-wide error types.

use thiserror::Error;

pub type OpStatsResult<T> = Result<T, OpStatsError>;

#[derive(Debug, Error)]
pub enum OpStatsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed capture content. Recoverable: the affected item is skipped.
    #[error("trace error: {0}")]
    Trace(String),

    /// Upstream contract breach, e.g. children time exceeding total time.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("executor error: {0}")]
    Executor(String),
}

impl From<rayon::ThreadPoolBuildError> for OpStatsError {
    fn from(value: rayon::ThreadPoolBuildError) -> Self {
        Self::Executor(value.to_string())
    }
}
