//! Cryptographic primitives for protected health information.
//!
//! This module provides:
//! - AES-256-GCM sealing with collision-free IV sequences
//! - Key-versioned data keys with rotation and a retirement grace period
//! - The hardware key provider capability that wraps data keys at rest
//! - Sealing of health records into encrypted cache rows

pub mod cipher;
pub mod keyring;
#[cfg(test)]
pub(crate) mod mock;
pub mod provider;
pub mod sealer;

pub use cipher::{DataKey, EncryptedData, IvSequence};
pub use keyring::EncryptionManager;
pub use provider::{HardwareKeyProvider, ProviderKind, SoftwareKeyProvider};
pub use sealer::RecordSealer;

use thiserror::Error;

/// Errors that can occur in cryptographic operations.
///
/// Every variant is treated as fatal by callers: no retry, fail closed.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Hardware-backed key storage unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("Unknown key version {0}")]
    UnknownKeyVersion(u32),

    #[error("Key version {0} is past its retention window")]
    KeyExpired(u32),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Authentication failed - data may have been tampered with")]
    AuthenticationFailed,

    #[error("Key wrapping failed: {0}")]
    KeyWrap(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("IV space exhausted for this session")]
    IvExhausted,

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
