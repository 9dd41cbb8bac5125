//! Symmetric encryption for sensitive cache entries.
//!
//! [`SecretBox`] derives an AES-256 key from a caller-provided secret with
//! PBKDF2-HMAC-SHA256 and seals values with AES-256-GCM. The wire format is
//! `nonce (12 bytes) || ciphertext`; the per-box salt is random unless the
//! caller pins one for cross-process agreement.

mod error;

pub use error::{SecretBoxError, SecretBoxResult};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::Sha256;

/// PBKDF2 iteration count for key derivation.
pub const KDF_ITERATIONS: u32 = 100_000;

/// Salt length in bytes.
pub const SALT_LEN: usize = 16;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Symmetric encryptor/decryptor with password-based key derivation.
pub struct SecretBox {
    cipher: Aes256Gcm,
    salt: [u8; SALT_LEN],
}

impl SecretBox {
    /// Derives a box from `secret` with a random salt.
    ///
    /// Distinct processes deriving from the same secret get distinct salts
    /// and therefore cannot read each other's entries; use
    /// [`SecretBox::with_salt`] when cross-process agreement is needed.
    pub fn new(secret: &str) -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::with_salt(secret, salt)
    }

    /// Derives a box from `secret` and a pinned `salt`.
    pub fn with_salt(secret: &str, salt: [u8; SALT_LEN]) -> Self {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), &salt, KDF_ITERATIONS, &mut key);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Self { cipher, salt }
    }

    /// Returns the key-derivation salt.
    #[inline]
    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    /// Seals `plaintext`, returning `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> SecretBoxResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| SecretBoxError::EncryptFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Opens `nonce || ciphertext` produced by [`SecretBox::encrypt`].
    pub fn decrypt(&self, data: &[u8]) -> SecretBoxResult<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(SecretBoxError::Malformed { len: data.len() });
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| SecretBoxError::DecryptFailed)
    }
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("SecretBox").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let sb = SecretBox::new("correct horse battery staple");
        let plain = b"the capital of France is Paris";
        let sealed = sb.encrypt(plain).unwrap();
        assert_ne!(&sealed[NONCE_LEN..], plain.as_slice());
        assert_eq!(sb.decrypt(&sealed).unwrap(), plain);
    }

    #[test]
    fn nonces_are_unique_per_message() {
        let sb = SecretBox::new("secret");
        let a = sb.encrypt(b"same").unwrap();
        let b = sb.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampering_is_detected() {
        let sb = SecretBox::new("secret");
        let mut sealed = sb.encrypt(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(sb.decrypt(&sealed).unwrap_err(), SecretBoxError::DecryptFailed);
    }

    #[test]
    fn wrong_secret_fails() {
        let salt = [7u8; SALT_LEN];
        let a = SecretBox::with_salt("alpha", salt);
        let b = SecretBox::with_salt("beta", salt);
        let sealed = a.encrypt(b"payload").unwrap();
        assert!(b.decrypt(&sealed).is_err());
    }

    #[test]
    fn shared_salt_allows_cross_box_reads() {
        let salt = [9u8; SALT_LEN];
        let a = SecretBox::with_salt("shared", salt);
        let b = SecretBox::with_salt("shared", salt);
        let sealed = a.encrypt(b"payload").unwrap();
        assert_eq!(b.decrypt(&sealed).unwrap(), b"payload");
    }

    #[test]
    fn truncated_input_rejected() {
        let sb = SecretBox::new("secret");
        assert!(matches!(
            sb.decrypt(&[0u8; 4]).unwrap_err(),
            SecretBoxError::Malformed { len: 4 }
        ));
    }
}
