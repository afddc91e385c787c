// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sealing of secrets at rest with AES-256-GCM.
//!
//! Sealed values are `base64(nonce || ciphertext)` with a random 96-bit nonce
//! per value. One [`Encryption`] client is created at startup from the
//! process key and shared read-only.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Errors from sealing and unsealing.
#[derive(Debug, Error)]
pub enum EncryptionError {
    /// The process key is not 32 bytes of base64.
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),
    /// Sealed value is not valid base64 or is too short.
    #[error("malformed sealed value")]
    Malformed,
    /// Authentication tag did not verify.
    #[error("decryption failed")]
    Decrypt,
    /// Encryption failed.
    #[error("encryption failed")]
    Encrypt,
}

/// AES-256-GCM sealing client.
#[derive(Clone)]
pub struct Encryption {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Encryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryption").finish_non_exhaustive()
    }
}

impl Encryption {
    /// Create a client from raw key bytes.
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(&key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Create a client from a base64-encoded 32-byte key.
    pub fn from_base64_key(encoded: &str) -> Result<Self, EncryptionError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| EncryptionError::InvalidKey(e.to_string()))?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            EncryptionError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, b.len()))
        })?;
        Ok(Self::new(key))
    }

    /// Seal `plaintext`, returning `base64(nonce || ciphertext)`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, EncryptionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| EncryptionError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    /// Open a value produced by [`seal`](Self::seal).
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, EncryptionError> {
        let bytes = STANDARD
            .decode(sealed)
            .map_err(|_| EncryptionError::Malformed)?;
        if bytes.len() <= NONCE_LEN {
            return Err(EncryptionError::Malformed);
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| EncryptionError::Decrypt)
    }
}
