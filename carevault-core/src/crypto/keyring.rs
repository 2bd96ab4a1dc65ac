//! Key-versioned encryption manager.
//!
//! Key hierarchy:
//! Hardware key (provider) → wraps → data key per version → AES-256-GCM record content
//!
//! Version numbers are allocated from one counter shared by all aliases, so a
//! ciphertext's `key_version` alone identifies its data key.

use crate::config::SecurityConfig;
use crate::crypto::cipher::{open, seal, DataKey, EncryptedData, IvSequence};
use crate::crypto::provider::HardwareKeyProvider;
use crate::crypto::{CryptoError, ProviderKind};
use crate::database::Database;
use crate::{DatabaseError, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::params;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// An unwrapped data key held in memory
struct KeyVersion {
    alias: String,
    key: DataKey,
    retired_at: Option<DateTime<Utc>>,
}

struct KeyringState {
    versions: BTreeMap<u32, KeyVersion>,
    current: HashMap<String, u32>,
    purged: BTreeSet<u32>,
    ivs: IvSequence,
}

/// Row of the `key_versions` table
struct StoredKey {
    version: u32,
    alias: String,
    wrapped_key: Option<Vec<u8>>,
    retired_at: Option<i64>,
    purged: bool,
}

/// Encrypts and decrypts record content under versioned data keys.
///
/// All operations serialize on one lock. The database lock is only ever taken
/// while that lock is held, never the other way round.
pub struct EncryptionManager {
    provider: Arc<dyn HardwareKeyProvider>,
    db: Arc<Mutex<Database>>,
    grace_period: Duration,
    state: Mutex<KeyringState>,
}

impl EncryptionManager {
    /// Load every stored key version and unwrap it with `provider`.
    ///
    /// Fails with `HardwareUnavailable` when hardware keys are required and the
    /// provider is software-only.
    pub fn new(
        provider: Arc<dyn HardwareKeyProvider>,
        db: Arc<Mutex<Database>>,
        security: &SecurityConfig,
    ) -> Result<Self> {
        if !provider.is_hardware_backed() {
            if security.require_hardware_keys {
                return Err(CryptoError::HardwareUnavailable(format!(
                    "{} provider is not hardware-backed",
                    provider.kind().as_str()
                ))
                .into());
            }
            warn!(
                provider = provider.kind().as_str(),
                "Hardware keys not required; using software key wrapping"
            );
        }

        let stored = {
            let db = db
                .lock()
                .map_err(|_| DatabaseError::LockPoisoned("load key versions".to_string()))?;
            load_key_versions(&db)?
        };

        let mut state = KeyringState {
            versions: BTreeMap::new(),
            current: HashMap::new(),
            purged: BTreeSet::new(),
            ivs: IvSequence::new(),
        };

        for row in stored {
            let wrapped = match (row.purged, row.wrapped_key) {
                (false, Some(wrapped)) => wrapped,
                _ => {
                    state.purged.insert(row.version);
                    continue;
                }
            };

            let raw = provider.unwrap_key(&row.alias, &wrapped)?;
            if row.retired_at.is_none() {
                state.current.insert(row.alias.clone(), row.version);
            }
            state.versions.insert(
                row.version,
                KeyVersion {
                    alias: row.alias,
                    key: DataKey::from_bytes(*raw),
                    retired_at: row.retired_at.and_then(timestamp_to_datetime),
                },
            );
        }

        info!(
            versions = state.versions.len(),
            purged = state.purged.len(),
            provider = provider.kind().as_str(),
            "Encryption manager ready"
        );

        Ok(Self {
            provider,
            db,
            grace_period: Duration::days(i64::from(security.key_grace_period_days)),
            state: Mutex::new(state),
        })
    }

    /// Encrypt `plaintext` under the current key version of `alias`.
    ///
    /// `aad` is authenticated but not encrypted; the same bytes must be passed
    /// to [`decrypt`](Self::decrypt). The first use of an alias creates its
    /// first key version.
    pub fn encrypt(&self, plaintext: &[u8], alias: &str, aad: &[u8]) -> Result<EncryptedData> {
        let mut state = self.lock_state()?;
        self.encrypt_locked(&mut state, plaintext, alias, aad)
    }

    /// Decrypt data produced by [`encrypt`](Self::encrypt).
    ///
    /// Retired versions decrypt only inside their grace period.
    pub fn decrypt(&self, data: &EncryptedData, aad: &[u8]) -> Result<Vec<u8>> {
        let state = self.lock_state()?;
        let key = self.key_for(&state, data.key_version, false)?;
        Ok(open(key, &data.iv, &data.ciphertext, aad)?)
    }

    /// Move a ciphertext to the current key version of `alias`.
    ///
    /// A retired version can be migrated until its key material is purged,
    /// even after its grace period ended. The plaintext never leaves the
    /// manager.
    pub fn reencrypt(&self, data: &EncryptedData, alias: &str, aad: &[u8]) -> Result<EncryptedData> {
        let mut state = self.lock_state()?;
        let key = self.key_for(&state, data.key_version, true)?;
        let plaintext = zeroize::Zeroizing::new(open(key, &data.iv, &data.ciphertext, aad)?);
        self.encrypt_locked(&mut state, &plaintext, alias, aad)
    }

    /// Serialize `value` to JSON and encrypt it.
    pub fn encrypt_json<T: Serialize>(
        &self,
        value: &T,
        alias: &str,
        aad: &[u8],
    ) -> Result<EncryptedData> {
        let plaintext = zeroize::Zeroizing::new(
            serde_json::to_vec(value).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        );
        self.encrypt(&plaintext, alias, aad)
    }

    /// Decrypt JSON produced by [`encrypt_json`](Self::encrypt_json).
    pub fn decrypt_json<T: DeserializeOwned>(&self, data: &EncryptedData, aad: &[u8]) -> Result<T> {
        let plaintext = zeroize::Zeroizing::new(self.decrypt(data, aad)?);
        serde_json::from_slice(&plaintext)
            .map_err(|e| DatabaseError::Serialization(e.to_string()).into())
    }

    fn encrypt_locked(
        &self,
        state: &mut KeyringState,
        plaintext: &[u8],
        alias: &str,
        aad: &[u8],
    ) -> Result<EncryptedData> {
        let version = match state.current.get(alias) {
            Some(version) => *version,
            None => self.create_version(state, alias)?,
        };

        let iv = state.ivs.next_iv()?;
        let entry = state
            .versions
            .get(&version)
            .ok_or(CryptoError::UnknownKeyVersion(version))?;
        let ciphertext = seal(&entry.key, &iv, plaintext, aad)?;

        Ok(EncryptedData {
            ciphertext,
            iv,
            key_version: version,
            timestamp: Utc::now(),
        })
    }

    /// Data key of `version`. Expired versions are refused unless `allow_expired`.
    fn key_for<'s>(
        &self,
        state: &'s KeyringState,
        version: u32,
        allow_expired: bool,
    ) -> Result<&'s DataKey> {
        if state.purged.contains(&version) {
            return Err(CryptoError::KeyExpired(version).into());
        }

        let entry = state
            .versions
            .get(&version)
            .ok_or(CryptoError::UnknownKeyVersion(version))?;

        if let Some(retired_at) = entry.retired_at {
            if !allow_expired && Utc::now() >= retired_at + self.grace_period {
                return Err(CryptoError::KeyExpired(version).into());
            }
        }
        Ok(&entry.key)
    }

    /// Retire the current key version of `alias` and make a new one current.
    ///
    /// Returns `false` when the alias had no key yet; its first version is
    /// created and nothing is retired.
    pub fn rotate_key(&self, alias: &str) -> Result<bool> {
        let mut state = self.lock_state()?;

        let Some(old) = state.current.get(alias).copied() else {
            let version = self.create_version(&mut state, alias)?;
            info!(alias, version, "Created first key version during rotation");
            return Ok(false);
        };

        let new = self.create_version(&mut state, alias)?;
        let now = Utc::now();
        {
            let db = self.lock_db()?;
            db.conn().execute(
                "UPDATE key_versions SET retired_at = ?1 WHERE version = ?2",
                params![now.timestamp(), old],
            )?;
        }
        if let Some(entry) = state.versions.get_mut(&old) {
            entry.retired_at = Some(now);
        }

        info!(alias, old_version = old, new_version = new, "Rotated data key");
        Ok(true)
    }

    /// Destroy key versions whose grace period has ended.
    ///
    /// Wrapped key material is erased from storage; the version row is kept so
    /// version numbers are never reused.
    pub fn purge_expired_keys(&self) -> Result<usize> {
        let mut state = self.lock_state()?;
        let now = Utc::now();

        let expired: Vec<u32> = state
            .versions
            .iter()
            .filter(|(_, entry)| {
                entry
                    .retired_at
                    .is_some_and(|retired_at| now >= retired_at + self.grace_period)
            })
            .map(|(version, _)| *version)
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }

        {
            let db = self.lock_db()?;
            let tx = db.conn().unchecked_transaction()?;
            for version in &expired {
                tx.execute(
                    "UPDATE key_versions SET wrapped_key = NULL, purged = 1 WHERE version = ?1",
                    [version],
                )?;
            }
            tx.commit()?;
        }

        for version in &expired {
            // DataKey zeroizes on drop
            if let Some(entry) = state.versions.remove(version) {
                info!(alias = %entry.alias, version, "Purged expired key version");
            }
            state.purged.insert(*version);
        }

        Ok(expired.len())
    }

    /// Current key version of `alias`, if one exists
    pub fn current_version(&self, alias: &str) -> Result<Option<u32>> {
        Ok(self.lock_state()?.current.get(alias).copied())
    }

    /// Key versions that are retired but still inside their grace period
    pub fn retired_versions(&self) -> Result<Vec<u32>> {
        let state = self.lock_state()?;
        let now = Utc::now();
        Ok(state
            .versions
            .iter()
            .filter(|(_, entry)| {
                entry
                    .retired_at
                    .is_some_and(|retired_at| now < retired_at + self.grace_period)
            })
            .map(|(version, _)| *version)
            .collect())
    }

    pub fn provider_kind(&self) -> ProviderKind {
        self.provider.kind()
    }

    fn create_version(&self, state: &mut KeyringState, alias: &str) -> Result<u32> {
        let key = DataKey::generate();
        let wrapped = self.provider.wrap_key(alias, key.as_bytes())?;
        let now = Utc::now();

        let version = {
            let db = self.lock_db()?;
            let conn = db.conn();
            let version: u32 = conn.query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM key_versions",
                [],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT INTO key_versions (version, alias, provider_kind, wrapped_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    version,
                    alias,
                    self.provider.kind().as_str(),
                    wrapped,
                    now.timestamp()
                ],
            )?;
            version
        };

        state.versions.insert(
            version,
            KeyVersion {
                alias: alias.to_string(),
                key,
                retired_at: None,
            },
        );
        state.current.insert(alias.to_string(), version);
        Ok(version)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, KeyringState>> {
        self.state
            .lock()
            .map_err(|_| CryptoError::LockPoisoned("encryption manager".to_string()).into())
    }

    fn lock_db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned("key versions".to_string()).into())
    }
}

fn load_key_versions(db: &Database) -> Result<Vec<StoredKey>> {
    let mut stmt = db.conn().prepare(
        "SELECT version, alias, wrapped_key, retired_at, purged
         FROM key_versions ORDER BY version ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(StoredKey {
                version: row.get(0)?,
                alias: row.get(1)?,
                wrapped_key: row.get(2)?,
                retired_at: row.get(3)?,
                purged: row.get::<_, i64>(4)? != 0,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn timestamp_to_datetime(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}
