use thiserror::Error;

/// Errors from adaptive-memory persistence.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Checkpoint/restore requested without a configured path.
    #[error("no persist path configured")]
    NoPersistPath,

    /// Filesystem failure.
    #[error("memory persistence io error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint file did not parse.
    #[error("memory checkpoint corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Convenience result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
