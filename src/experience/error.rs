use thiserror::Error;

/// Errors from the experience log.
#[derive(Debug, Error)]
pub enum ExperienceError {
    /// Filesystem failure.
    #[error("experience log io error: {0}")]
    Io(#[from] std::io::Error),

    /// Record serialization failure.
    #[error("experience record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Convenience result type for experience-log operations.
pub type ExperienceResult<T> = Result<T, ExperienceError>;
