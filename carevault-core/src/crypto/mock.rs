//! Mock key provider for unit tests.
//!
//! Reports whatever keystore kind it is configured with, so the hardware
//! requirement of the encryption manager can be exercised without a device.

use crate::crypto::provider::{unwrap_with, wrap_with, HardwareKeyProvider, ProviderKind};
use crate::crypto::Result;
use aes_gcm::aead::OsRng;
use rand::RngCore;
use std::sync::Arc;
use zeroize::Zeroizing;

/// In-memory key provider with a configurable kind.
#[derive(Clone)]
pub struct MockKeyProvider {
    kek: Arc<Zeroizing<[u8; 32]>>,
    kind: ProviderKind,
    hardware_backed: bool,
}

impl MockKeyProvider {
    /// A Secure Enclave look-alike with a fixed wrapping key.
    ///
    /// All instances share the key, so wrapped keys survive "restarts".
    pub fn new_deterministic() -> Self {
        Self {
            kek: Arc::new(Zeroizing::new([0x42u8; 32])),
            kind: ProviderKind::SecureEnclave,
            hardware_backed: true,
        }
    }

    /// A hardware-backed provider with a random wrapping key.
    pub fn new_random() -> Self {
        let mut kek = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut kek[..]);
        Self {
            kek: Arc::new(kek),
            kind: ProviderKind::AndroidKeystore,
            hardware_backed: true,
        }
    }

    /// Override the reported keystore kind and hardware flag.
    pub fn with_kind(mut self, kind: ProviderKind, hardware_backed: bool) -> Self {
        self.kind = kind;
        self.hardware_backed = hardware_backed;
        self
    }
}

impl HardwareKeyProvider for MockKeyProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn is_hardware_backed(&self) -> bool {
        self.hardware_backed
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
    fn deterministic_providers_share_wrapping_key() {
        let a = MockKeyProvider::new_deterministic();
        let b = MockKeyProvider::new_deterministic();

        let wrapped = a.wrap_key("phi", &[5u8; 32]).unwrap();
        assert_eq!(*b.unwrap_key("phi", &wrapped).unwrap(), [5u8; 32]);
    }

    #[test]
    fn random_providers_do_not_share_wrapping_key() {
        let a = MockKeyProvider::new_random();
        let b = MockKeyProvider::new_random();

        let wrapped = a.wrap_key("phi", &[5u8; 32]).unwrap();
        assert!(b.unwrap_key("phi", &wrapped).is_err());
    }

    #[test]
    fn kind_can_be_overridden() {
        let provider = MockKeyProvider::new_deterministic()
            .with_kind(ProviderKind::SoftwareFallback, false);
        assert_eq!(provider.kind(), ProviderKind::SoftwareFallback);
        assert!(!provider.is_hardware_backed());
    }
}
