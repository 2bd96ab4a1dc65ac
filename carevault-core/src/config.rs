//! Runtime configuration, loaded from TOML.

use crate::platform::{get_default_database_path, get_default_software_key_path};
use crate::sync::ConflictPolicy;
use crate::{CareError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CareConfig {
    pub api: ApiConfig,
    pub cache: CacheConfig,
    pub sync: SyncSettings,
    pub security: SecurityConfig,
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_version: u32,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.example-health.com".to_string(),
            api_version: 1,
            timeout_secs: 30,
            max_attempts: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 8_000,
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 30,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub database_path: PathBuf,
    pub max_page_size: u32,
    pub ttl_secs: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            database_path: get_default_database_path(),
            max_page_size: 100,
            ttl_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub interval_secs: u64,
    pub conflict_policy: ConflictPolicy,
    /// Patients reconciled by the periodic schedule
    pub entities: Vec<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 15 * 60,
            conflict_policy: ConflictPolicy::ServerWins,
            entities: Vec::new(),
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub require_hardware_keys: bool,
    pub key_grace_period_days: u32,
    pub default_key_alias: String,
    /// Wrapping key file used only when hardware keys are not required
    pub software_key_path: PathBuf,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            require_hardware_keys: true,
            key_grace_period_days: 7,
            default_key_alias: "phi-records".to_string(),
            software_key_path: get_default_software_key_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub max_attachments: usize,
    pub max_content_bytes: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_attachments: 10,
            max_content_bytes: 256 * 1024,
        }
    }
}

impl CareConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CareError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check bounds that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(CareError::Config("api.base_url must not be empty".into()));
        }
        if self.api.max_attempts == 0 {
            return Err(CareError::Config("api.max_attempts must be at least 1".into()));
        }
        if self.api.breaker_failure_threshold == 0 {
            return Err(CareError::Config(
                "api.breaker_failure_threshold must be at least 1".into(),
            ));
        }
        if self.api.base_backoff_ms > self.api.max_backoff_ms {
            return Err(CareError::Config(
                "api.base_backoff_ms exceeds api.max_backoff_ms".into(),
            ));
        }
        if self.cache.max_page_size == 0 {
            return Err(CareError::Config("cache.max_page_size must be at least 1".into()));
        }
        if self.sync.interval_secs == 0 {
            return Err(CareError::Config("sync.interval_secs must be at least 1".into()));
        }
        if self.security.default_key_alias.trim().is_empty() {
            return Err(CareError::Config(
                "security.default_key_alias must not be empty".into(),
            ));
        }
        Ok(())
    }
}
