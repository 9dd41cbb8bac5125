use thiserror::Error;

/// Configuration failures surfaced at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The balancing strategy name is not one of the documented values.
    #[error("invalid balancing strategy: {value}")]
    InvalidStrategy {
        /// The rejected value.
        value: String,
    },

    /// A router variant did not parse as `name|min_ram_bytes|quality`.
    #[error("invalid router variant (want name|min_ram_bytes|quality): {value}")]
    InvalidVariant {
        /// The rejected fragment.
        value: String,
    },

    /// Cross-field validation failed.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// What was inconsistent.
        reason: String,
    },
}
