//! Symmetric encryption of sensitive job fields (the dispatching client's
//! auth token) before they are written to the queue.
//!
//! ChaCha20-Poly1305 with a key derived from the configured secret by
//! SHA-256. Ciphertexts are `base64(nonce || ciphertext)`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use herald_common::error::AppError;
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must not be empty")]
    EmptyKey,

    #[error("ciphertext is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("ciphertext is too short")]
    Truncated,

    #[error("ciphertext could not be authenticated")]
    Cipher,

    #[error("plaintext is not valid UTF-8")]
    Utf8,
}

impl From<CryptoError> for AppError {
    fn from(err: CryptoError) -> Self {
        AppError::Crypto(err.to_string())
    }
}

/// Encrypts and decrypts short strings. Shared read-only by every worker.
#[derive(Clone)]
pub struct Cryptographer {
    cipher: ChaCha20Poly1305,
}

impl Cryptographer {
    pub fn new(secret: &str) -> Result<Self, CryptoError> {
        if secret.is_empty() {
            return Err(CryptoError::EmptyKey);
        }

        let digest = Sha256::digest(secret.as_bytes());
        let cipher = ChaCha20Poly1305::new(Key::from_slice(digest.as_slice()));
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Cipher)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CryptoError> {
        let sealed = BASE64.decode(encoded)?;
        if sealed.len() <= NONCE_SIZE {
            return Err(CryptoError::Truncated);
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Cipher)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
    }
}

impl std::fmt::Debug for Cryptographer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cryptographer { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrypts_what_it_encrypts() {
        let crypto = Cryptographer::new("my-secret").unwrap();
        let sealed = crypto.encrypt("bearer-token").unwrap();
        assert_ne!(sealed, "bearer-token");
        assert_eq!(crypto.decrypt(&sealed).unwrap(), "bearer-token");
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let crypto = Cryptographer::new("my-secret").unwrap();
        assert_ne!(crypto.encrypt("token").unwrap(), crypto.encrypt("token").unwrap());
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let sealed = Cryptographer::new("key-one").unwrap().encrypt("token").unwrap();
        let err = Cryptographer::new("key-two").unwrap().decrypt(&sealed).unwrap_err();
        assert!(matches!(err, CryptoError::Cipher));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let crypto = Cryptographer::new("my-secret").unwrap();
        assert!(matches!(crypto.decrypt("%%%"), Err(CryptoError::Encoding(_))));
        assert!(matches!(crypto.decrypt("AAAA"), Err(CryptoError::Truncated)));
    }

    #[test]
    fn test_empty_key_is_rejected() {
        assert!(matches!(Cryptographer::new(""), Err(CryptoError::EmptyKey)));
    }
}
