use thiserror::Error;

use crate::constants::DimValidationError;

/// Errors from the vector recall index.
#[derive(Debug, Error)]
pub enum RecallError {
    /// A vector of the wrong length reached the index.
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// The index's fixed dimension.
        expected: usize,
        /// The offending vector's length.
        actual: usize,
    },

    /// The configured dimension itself is unusable.
    #[error(transparent)]
    InvalidDimension(#[from] DimValidationError),

    /// Snapshot file could not be read or written.
    #[error("vector index io error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot header did not parse.
    #[error("vector index header corrupt: {0}")]
    Header(#[from] serde_json::Error),

    /// Snapshot contents are inconsistent.
    #[error("vector index snapshot corrupt: {reason}")]
    CorruptSnapshot {
        /// What was inconsistent.
        reason: String,
    },
}

/// Convenience result type for recall operations.
pub type RecallResult<T> = Result<T, RecallError>;
