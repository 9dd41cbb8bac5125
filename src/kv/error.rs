use thiserror::Error;

/// Errors surfaced by a [`super::KvStore`] backend.
#[derive(Debug, Clone, Error)]
pub enum KvError {
    /// The backend rejected or failed the operation.
    #[error("kv backend error: {message}")]
    Backend {
        /// Backend-provided detail.
        message: String,
    },
}

/// Convenience result type for KV operations.
pub type KvResult<T> = Result<T, KvError>;
