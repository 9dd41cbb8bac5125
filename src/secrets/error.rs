use thiserror::Error;

/// Errors returned by [`super::SecretBox`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretBoxError {
    /// Sealing failed (should not happen with a well-formed key).
    #[error("encryption failed")]
    EncryptFailed,

    /// Authentication failed: wrong key, wrong salt, or tampered data.
    #[error("decryption failed (wrong key or corrupted data)")]
    DecryptFailed,

    /// Input shorter than the nonce prefix.
    #[error("sealed data too short ({len} bytes)")]
    Malformed {
        /// Observed input length.
        len: usize,
    },
}

/// Convenience result type for secret-box operations.
pub type SecretBoxResult<T> = Result<T, SecretBoxError>;
