//! Engine error taxonomy with machine-readable kinds and CLI exit codes

use thiserror::Error;

/// Errors surfaced by the retrieval engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// API misuse: bad parameters, empty corpus, malformed filter syntax
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A passage id was ingested twice under the strict duplicate policy
    #[error("duplicate passage id: {0}")]
    DuplicateId(String),

    /// The index was built with a different embedding model than the active provider
    #[error("model mismatch: index built with '{index}', provider is '{provider}'")]
    ModelMismatch { index: String, provider: String },

    /// On-disk artifact failed validation (bad magic, wrong size, broken invariant)
    #[error("corrupt index: {0}")]
    Corrupt(String),

    /// Node index outside `[0, N)`
    #[error("node index {node} out of range (index has {len} nodes)")]
    OutOfRange { node: u32, len: u64 },

    /// Embedding provider failed in a way worth retrying
    #[error("embedding provider transient failure: {0}")]
    ProviderTransient(String),

    /// Embedding provider failed permanently
    #[error("embedding provider failure: {0}")]
    ProviderPermanent(String),

    /// Per-query wall-clock deadline expired
    #[error("search deadline exceeded")]
    DeadlineExceeded,

    /// Search was cancelled through its cancellation token
    #[error("search cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Process exit code for the CLI, per the engine's error contract
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::InvalidInput(_)
            | EngineError::DuplicateId(_)
            | EngineError::OutOfRange { .. }
            | EngineError::Io(_)
            | EngineError::Json(_) => 1,
            EngineError::ModelMismatch { .. } => 2,
            EngineError::Corrupt(_) => 3,
            EngineError::ProviderTransient(_) | EngineError::ProviderPermanent(_) => 4,
            EngineError::DeadlineExceeded => 5,
            EngineError::Cancelled => 6,
        }
    }

    /// Short machine-readable kind string, used in responses and logs
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::DuplicateId(_) => "duplicate_id",
            EngineError::ModelMismatch { .. } => "model_mismatch",
            EngineError::Corrupt(_) => "corrupt",
            EngineError::OutOfRange { .. } => "out_of_range",
            EngineError::ProviderTransient(_) => "provider_transient",
            EngineError::ProviderPermanent(_) => "provider_permanent",
            EngineError::DeadlineExceeded => "deadline_exceeded",
            EngineError::Cancelled => "cancelled",
            EngineError::Io(_) => "io",
            EngineError::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(EngineError::InvalidInput("x".into()).exit_code(), 1);
        assert_eq!(
            EngineError::ModelMismatch {
                index: "a".into(),
                provider: "b".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(EngineError::Corrupt("x".into()).exit_code(), 3);
        assert_eq!(EngineError::ProviderPermanent("x".into()).exit_code(), 4);
        assert_eq!(EngineError::DeadlineExceeded.exit_code(), 5);
        assert_eq!(EngineError::Cancelled.exit_code(), 6);
    }
}
