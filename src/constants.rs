//! Cross-cutting, shared constants.
//!
//! Prefer deriving secondary constants from primary ones to avoid drift.
//!
//! # Dimension Invariants
//!
//! The embedding dimension is fixed when the recall index is constructed and
//! every write is validated against it. [`DimConfig`] carries the runtime
//! value through initialization; [`validate_embedding_dim`] catches
//! mismatches at module boundaries.

/// Default embedding dimension for experience vectors.
pub const DEFAULT_EMBEDDING_DIM: usize = 384;

/// Bytes per stored embedding row at the default dimension.
pub const EMBEDDING_F32_BYTES: usize = DEFAULT_EMBEDDING_DIM * 4;

/// CPU utilisation (percent) at which new dispatches are rejected.
pub const CPU_OVERLOAD_PCT: f32 = 90.0;

/// CPU utilisation (percent) at which the dispatcher logs a degraded warning.
pub const CPU_DEGRADED_PCT: f32 = 80.0;

/// Temperature (°C) at which new dispatches are rejected.
pub const TEMP_OVERLOAD_C: f32 = 90.0;

/// Temperature (°C) at which the dispatcher logs a degraded warning.
pub const TEMP_DEGRADED_C: f32 = 80.0;

/// Default free-RAM floor below which dispatches are rejected (512 MiB).
pub const DEFAULT_RAM_FLOOR_BYTES: u64 = 512 * 1024 * 1024;

/// Default adaptive-memory token budget.
pub const DEFAULT_TOKEN_BUDGET: u32 = 300;

/// Default adaptive-memory admission floor.
pub const DEFAULT_IMPORTANCE_THRESHOLD: f64 = 0.5;

/// Default per-call dispatch timeout in seconds.
pub const DEFAULT_DISPATCH_TIMEOUT_SECS: u64 = 30;

/// Timeout for background health checks and probe refreshes, in seconds.
pub const BACKGROUND_CHECK_TIMEOUT_SECS: u64 = 5;

/// Runtime dimension configuration for modules that agree on vector sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimConfig {
    /// The embedding vector dimension (number of floats).
    pub embedding_dim: usize,
}

impl Default for DimConfig {
    fn default() -> Self {
        Self {
            embedding_dim: DEFAULT_EMBEDDING_DIM,
        }
    }
}

impl DimConfig {
    /// Creates a configuration with the given embedding dimension.
    pub fn new(embedding_dim: usize) -> Self {
        Self { embedding_dim }
    }

    /// Validates that this configuration is usable.
    pub fn validate(&self) -> Result<(), DimValidationError> {
        validate_embedding_dim(self.embedding_dim)?;
        Ok(())
    }
}

/// Error raised when an embedding dimension is unusable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DimValidationError {
    /// Zero-sized vectors carry no information.
    #[error("embedding dimension must be non-zero")]
    Zero,
    /// Guards against misconfiguration (e.g. bytes passed where a count was expected).
    #[error("embedding dimension {dim} exceeds the supported maximum {max}")]
    TooLarge {
        /// The rejected dimension.
        dim: usize,
        /// The supported maximum.
        max: usize,
    },
}

/// Upper bound accepted for embedding dimensions.
pub const MAX_EMBEDDING_DIM: usize = 16_384;

/// Checks an embedding dimension at a module boundary.
pub fn validate_embedding_dim(dim: usize) -> Result<usize, DimValidationError> {
    if dim == 0 {
        return Err(DimValidationError::Zero);
    }
    if dim > MAX_EMBEDDING_DIM {
        return Err(DimValidationError::TooLarge {
            dim,
            max: MAX_EMBEDDING_DIM,
        });
    }
    Ok(dim)
}
