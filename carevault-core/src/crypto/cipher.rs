//! AES-256-GCM encryption and decryption for cached records.
//!
//! Uses AES-256-GCM with:
//! - 256-bit data key per key version
//! - 96-bit (12 byte) IV built from a random session prefix and a counter
//! - 128-bit authentication tag appended to the ciphertext

use crate::crypto::{CryptoError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Length of the GCM IV in bytes
pub const IV_LEN: usize = 12;

/// A data key used to encrypt record content under one key version.
///
/// The key is wrapped by the hardware key provider before it is persisted
/// and only ever held unwrapped in memory.
#[derive(Clone)]
pub struct DataKey {
    key: Zeroizing<[u8; 32]>,
}

impl DataKey {
    /// Generate a new random data key
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self {
            key: Zeroizing::new(key.into()),
        }
    }

    /// Create a data key from raw bytes
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Create a data key from a slice, checking its length
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            got: bytes.len(),
        })?;
        Ok(Self::from_bytes(key))
    }

    /// Get the raw key bytes (use sparingly)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

/// Ciphertext produced by the encryption manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    /// Encrypted bytes with the 16-byte GCM tag appended
    pub ciphertext: Vec<u8>,

    /// IV used for this encryption, unique per key version
    pub iv: [u8; IV_LEN],

    /// Key version that produced the ciphertext
    pub key_version: u32,

    /// When the data was encrypted
    pub timestamp: DateTime<Utc>,
}

/// Generator of IVs that never repeat within a session.
///
/// Layout: `prefix(4, random per session) || counter(8, big-endian)`.
pub struct IvSequence {
    prefix: [u8; 4],
    counter: u64,
}

impl IvSequence {
    /// Start a new sequence with a random prefix
    pub fn new() -> Self {
        let mut prefix = [0u8; 4];
        OsRng.fill_bytes(&mut prefix);
        Self { prefix, counter: 0 }
    }

    /// Produce the next IV
    pub fn next_iv(&mut self) -> Result<[u8; IV_LEN]> {
        let counter = self.counter;
        self.counter = counter.checked_add(1).ok_or(CryptoError::IvExhausted)?;

        let mut iv = [0u8; IV_LEN];
        iv[..4].copy_from_slice(&self.prefix);
        iv[4..].copy_from_slice(&counter.to_be_bytes());
        Ok(iv)
    }
}

impl Default for IvSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Encrypt `plaintext` under `key` with the given IV, authenticating `aad`.
///
/// The caller is responsible for never reusing an IV with the same key.
pub fn seal(key: &DataKey, iv: &[u8; IV_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if plaintext.is_empty() {
        return Err(CryptoError::EncryptionFailed(
            "Cannot encrypt empty data".to_string(),
        ));
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    cipher
        .encrypt(Nonce::from_slice(iv), Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::EncryptionFailed(format!("{}", e)))
}

/// Decrypt and authenticate `ciphertext` (tag appended) and `aad` under `key`.
pub fn open(key: &DataKey, iv: &[u8; IV_LEN], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    // 1 byte of payload + 16 byte tag
    if ciphertext.len() < 17 {
        return Err(CryptoError::DecryptionFailed(
            "Ciphertext too short".to_string(),
        ));
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    cipher
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
}
