//! Hardware key provider capability.
//!
//! Data keys are never persisted in the clear: they are wrapped by a
//! device-bound key that lives in the platform keystore.
//!
//! Platform implementations:
//! - Android: hardware-backed Keystore (`ProviderKind::AndroidKeystore`)
//! - iOS: Secure Enclave (`ProviderKind::SecureEnclave`)
//! - Desktop/dev: file or memory backed software key (`SoftwareKeyProvider`),
//!   refused whenever hardware keys are required

use crate::crypto::{CryptoError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use zeroize::Zeroizing;

/// Which keystore backs a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    AndroidKeystore,
    SecureEnclave,
    SoftwareFallback,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AndroidKeystore => "android_keystore",
            Self::SecureEnclave => "secure_enclave",
            Self::SoftwareFallback => "software_fallback",
        }
    }
}

/// Wraps and unwraps data keys with a device-bound key.
///
/// # Security Requirements
///
/// - Wrapping must be authenticated and bound to the key alias
/// - `is_hardware_backed` must only report `true` when the wrapping key
///   cannot leave secure hardware
pub trait HardwareKeyProvider: Send + Sync {
    /// Keystore family of this provider
    fn kind(&self) -> ProviderKind;

    /// Whether the wrapping key is protected by secure hardware
    fn is_hardware_backed(&self) -> bool;

    /// Wrap a data key for storage.
    ///
    /// Returns `nonce(12) || ciphertext || tag(16)`.
    fn wrap_key(&self, alias: &str, key: &[u8; 32]) -> Result<Vec<u8>>;

    /// Unwrap a data key previously produced by `wrap_key` for the same alias.
    fn unwrap_key(&self, alias: &str, wrapped: &[u8]) -> Result<Zeroizing<[u8; 32]>>;
}

/// Wrap `key` under `kek` with the alias as associated data.
pub(crate) fn wrap_with(kek: &[u8; 32], alias: &str, key: &[u8; 32]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(kek.into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: key.as_ref(),
                aad: alias.as_bytes(),
            },
        )
        .map_err(|e| CryptoError::KeyWrap(format!("Failed to wrap key: {}", e)))?;

    let mut wrapped = Vec::with_capacity(12 + ciphertext.len());
    wrapped.extend_from_slice(&nonce);
    wrapped.extend_from_slice(&ciphertext);
    Ok(wrapped)
}

/// Reverse of [`wrap_with`].
pub(crate) fn unwrap_with(kek: &[u8; 32], alias: &str, wrapped: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    // 12 (nonce) + 32 (key) + 16 (tag)
    if wrapped.len() != 60 {
        return Err(CryptoError::KeyWrap(format!(
            "Wrapped key has invalid length {}",
            wrapped.len()
        )));
    }

    let cipher = Aes256Gcm::new(kek.into());
    let nonce = Nonce::from_slice(&wrapped[..12]);

    let key = Zeroizing::new(
        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &wrapped[12..],
                    aad: alias.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)?,
    );

    let key: [u8; 32] = key
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            got: key.len(),
        })?;
    Ok(Zeroizing::new(key))
}

/// Software wrapping key for development builds and desktop tooling.
///
/// Never hardware-backed; the encryption manager refuses it unless
/// hardware keys are explicitly not required.
pub struct SoftwareKeyProvider {
    kek: Zeroizing<[u8; 32]>,
}

impl SoftwareKeyProvider {
    /// Create a provider with a random, process-lifetime wrapping key
    pub fn ephemeral() -> Self {
        let mut kek = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut kek[..]);
        Self { kek }
    }

    /// Load the wrapping key from `path`, creating it on first use.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let bytes = Zeroizing::new(fs::read(path)?);
            let kek: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Key file {:?} is corrupt", path),
                )
            })?;
            return Ok(Self {
                kek: Zeroizing::new(kek),
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let provider = Self::ephemeral();
        fs::write(path, &provider.kek[..])?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        tracing::warn!("Created software wrapping key at {:?}", path);
        Ok(provider)
    }
}

impl HardwareKeyProvider for SoftwareKeyProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::SoftwareFallback
    }

    fn is_hardware_backed(&self) -> bool {
        false
    }

    fn wrap_key(&self, alias: &str, key: &[u8; 32]) -> Result<Vec<u8>> {
        wrap_with(&self.kek, alias, key)
    }

    fn unwrap_key(&self, alias: &str, wrapped: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
        unwrap_with(&self.kek, alias, wrapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let provider = SoftwareKeyProvider::ephemeral();
        let key = [9u8; 32];

        let wrapped = provider.wrap_key("phi", &key).unwrap();
        assert_eq!(wrapped.len(), 60);

        let unwrapped = provider.unwrap_key("phi", &wrapped).unwrap();
        assert_eq!(*unwrapped, key);
    }

    #[test]
    fn test_unwrap_with_other_alias_fails() {
        let provider = SoftwareKeyProvider::ephemeral();
        let wrapped = provider.wrap_key("phi", &[1u8; 32]).unwrap();

        assert!(provider.unwrap_key("wearables", &wrapped).is_err());
    }

    #[test]
    fn test_software_provider_is_not_hardware_backed() {
        let provider = SoftwareKeyProvider::ephemeral();
        assert!(!provider.is_hardware_backed());
        assert_eq!(provider.kind(), ProviderKind::SoftwareFallback);
    }

    #[test]
    fn test_load_or_create_persists_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("wrapping.key");

        let first = SoftwareKeyProvider::load_or_create(&path).unwrap();
        let wrapped = first.wrap_key("phi", &[3u8; 32]).unwrap();

        let second = SoftwareKeyProvider::load_or_create(&path).unwrap();
        assert_eq!(*second.unwrap_key("phi", &wrapped).unwrap(), [3u8; 32]);
    }

    #[test]
    fn test_corrupt_key_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wrapping.key");
        fs::write(&path, b"short").unwrap();

        assert!(SoftwareKeyProvider::load_or_create(&path).is_err());
    }
}
