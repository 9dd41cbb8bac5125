use thiserror::Error;

/// Errors from [`super::BackendPool`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The referenced backend is not registered.
    #[error("unknown backend: {id}")]
    UnknownBackend {
        /// The missing id.
        id: String,
    },

    /// A backend with this id already exists.
    #[error("backend already registered: {id}")]
    DuplicateBackend {
        /// The colliding id.
        id: String,
    },

    /// The spec violates a field constraint.
    #[error("invalid backend spec: {reason}")]
    InvalidSpec {
        /// What was wrong.
        reason: String,
    },
}

/// Convenience result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors from [`super::LoadBalancer::pick`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalancerError {
    /// No backend is currently online.
    #[error("no online backend available")]
    NoBackend,
}
