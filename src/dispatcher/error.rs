use thiserror::Error;

use crate::task::TaskError;

/// The error taxonomy surfaced to dispatch callers.
///
/// Transport and protocol faults are converted internally; only these kinds
/// escape. `Overloaded`, `Unavailable` and `Timeout` are worth retrying
/// from the caller's side; the rest are terminal.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The task violated a structural invariant or parameter range.
    #[error("bad request: {0}")]
    BadRequest(#[from] TaskError),

    /// Admission refused: resource gate tripped or the queue is full.
    #[error("overloaded: {reason}")]
    Overloaded {
        /// Which gate refused.
        reason: String,
    },

    /// No healthy backend, or reservations kept failing.
    #[error("unavailable: {reason}")]
    Unavailable {
        /// What was missing.
        reason: String,
    },

    /// The per-call deadline passed.
    #[error("timed out after {elapsed_ms} ms")]
    Timeout {
        /// Time spent before giving up.
        elapsed_ms: u64,
    },

    /// The caller's cancellation token fired.
    #[error("cancelled")]
    Cancelled,

    /// The runtime reported a terminal model-level failure.
    #[error("model error: {message}")]
    Model {
        /// Runtime-provided detail, preserved verbatim.
        message: String,
    },

    /// An invariant broke; details are in the logs.
    #[error("internal error: {message}")]
    Internal {
        /// What broke.
        message: String,
    },
}

impl DispatchError {
    /// Returns `true` when the caller may reasonably retry.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DispatchError::Overloaded { .. }
                | DispatchError::Unavailable { .. }
                | DispatchError::Timeout { .. }
        )
    }
}

/// Convenience result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;
