//! CareVault Core Library
//!
//! Client-side storage and synchronization of protected health information:
//! key-versioned AES-256-GCM encryption behind a hardware key provider,
//! an encrypted SQLite record cache, the sync reconciliation cycle, and the
//! repository that orchestrates cache-first reads and uploads.

pub mod api;
pub mod audit;
pub mod config;
pub mod crypto;
pub mod database;
pub mod observable;
pub mod platform;
pub mod records;
pub mod repository;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiError, ConnectivityMonitor, HealthRecordService, RemoteRecord};
pub use config::CareConfig;
pub use crypto::{CryptoError, EncryptedData, EncryptionManager, HardwareKeyProvider, ProviderKind};
pub use database::{Database, RecordCache};
pub use observable::Subscription;
pub use records::{HealthRecord, RecordStatus, RecordType, ValidationError};
pub use repository::{RecordFilter, RecordsEvent, Repository, UploadState};
pub use sync::{ConflictPolicy, SyncManager, SyncPhase, SyncReport};

use thiserror::Error;

/// Result type for CareVault operations
pub type Result<T> = std::result::Result<T, CareError>;

/// Errors raised by the local database layer
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: i32, found: i32 },

    #[error("File error: {0}")]
    FileIo(String),

    #[error("{0}")]
    Other(String),
}

/// General error type for CareVault operations
#[derive(Error, Debug)]
pub enum CareError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Security error: {0}")]
    Security(#[from] CryptoError),

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Sync conflict: {0}")]
    Conflict(String),

    #[error("Not authorized by server: {0}")]
    Unauthorized(String),

    #[error("Server rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("A sync cycle is already in progress")]
    AlreadySyncing,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CareError {
    /// Errors that should leave a write queued for a later sync instead of failing it.
    pub fn is_offline(&self) -> bool {
        matches!(self, Self::Network(_) | Self::CircuitOpen)
    }

    /// Errors that must terminate the session rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Security(_))
    }
}

impl From<ApiError> for CareError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Network(msg) => Self::Network(msg),
            ApiError::CircuitOpen => Self::CircuitOpen,
            ApiError::Validation(msg) => Self::Validation(ValidationError::Remote(msg)),
            ApiError::Conflict(msg) => Self::Conflict(msg),
            ApiError::Unauthorized(msg) => Self::Unauthorized(msg),
            ApiError::Rejected { status, body } => Self::Rejected { status, body },
            ApiError::Decode(msg) => Self::Database(DatabaseError::Serialization(msg)),
        }
    }
}

impl From<rusqlite::Error> for CareError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(DatabaseError::Sqlite(e))
    }
}
