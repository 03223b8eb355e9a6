//! Symmetric encryption for cached credential fields.
//!
//! Tokens stored in the shared Redis are AES-256-GCM encrypted with a
//! process-wide key derived from the operator-supplied key material. Each
//! ciphertext carries its random nonce up front and travels base64-encoded,
//! so stored values stay plain strings.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::error::{DispatcherError, DispatcherResult};

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Builds a cipher from arbitrary key material. The material is hashed
    /// to the 32 bytes AES-256 requires, so any non-empty string works.
    pub fn new(key_material: &str) -> DispatcherResult<Self> {
        if key_material.is_empty() {
            return Err(DispatcherError::Crypto(
                "encryption key must not be empty".to_string(),
            ));
        }
        let digest = Sha256::digest(key_material.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypts a value for storage. Whitespace is trimmed first so copied
    /// credentials with stray newlines round-trip cleanly.
    pub fn encrypt(&self, plaintext: &str) -> DispatcherResult<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.trim().as_bytes())
            .map_err(|_| DispatcherError::Crypto("encryption failed".to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    pub fn decrypt(&self, stored: &str) -> DispatcherResult<String> {
        let combined = BASE64
            .decode(stored)
            .map_err(|e| DispatcherError::Crypto(format!("invalid ciphertext encoding: {}", e)))?;
        if combined.len() <= NONCE_LEN {
            return Err(DispatcherError::Crypto("ciphertext too short".to_string()));
        }

        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| DispatcherError::Crypto("decryption failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| DispatcherError::Crypto("decrypted value is not UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_token() {
        let cipher = TokenCipher::new("unit-test-key").unwrap();
        let stored = cipher.encrypt("secret-access-token").unwrap();
        assert_ne!(stored, "secret-access-token");
        assert_eq!(cipher.decrypt(&stored).unwrap(), "secret-access-token");
    }

    #[test]
    fn trims_whitespace_before_encrypting() {
        let cipher = TokenCipher::new("unit-test-key").unwrap();
        let stored = cipher.encrypt("  token-with-newline\n").unwrap();
        assert_eq!(cipher.decrypt(&stored).unwrap(), "token-with-newline");
    }

    #[test]
    fn each_encryption_gets_a_fresh_nonce() {
        let cipher = TokenCipher::new("unit-test-key").unwrap();
        let first = cipher.encrypt("same").unwrap();
        let second = cipher.encrypt("same").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let cipher = TokenCipher::new("key-a").unwrap();
        let other = TokenCipher::new("key-b").unwrap();
        let stored = cipher.encrypt("value").unwrap();
        assert!(other.decrypt(&stored).is_err());
    }

    #[test]
    fn garbage_input_is_rejected() {
        let cipher = TokenCipher::new("key").unwrap();
        assert!(cipher.decrypt("not base64 !!!").is_err());
        assert!(cipher.decrypt("aGVsbG8=").is_err());
    }

    #[test]
    fn empty_key_material_is_rejected() {
        assert!(TokenCipher::new("").is_err());
    }
}
