//! Database schema and connection management.

use crate::{DatabaseError, Result};
use rusqlite::Connection;
use std::path::Path;

/// Current schema version. Incremented when the schema changes.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Main database connection and schema manager
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(DatabaseError::Sqlite)?;

        // Enable foreign key constraints
        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(DatabaseError::Sqlite)?;

        Ok(Self { conn })
    }

    /// Create a new in-memory database for testing
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::Sqlite)?;

        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(DatabaseError::Sqlite)?;

        Ok(Self { conn })
    }

    /// Open and fully initialize a database in one step
    pub fn open_initialized<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Self::open(path)?;
        db.initialize_schema()?;
        db.validate_schema_version()?;
        Ok(db)
    }

    /// Initialize the database schema
    pub fn initialize_schema(&self) -> Result<()> {
        self.create_db_metadata_table()?;
        self.create_health_records_table()?;
        self.create_key_versions_table()?;
        self.create_sync_tables()?;
        self.create_cache_tables()?;
        self.create_audit_table()?;
        self.create_indexes()?;
        Ok(())
    }

    fn create_db_metadata_table(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS db_metadata (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )",
                [],
            )
            .map_err(DatabaseError::Sqlite)?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO db_metadata (id, version, created_at)
                 VALUES (1, ?1, strftime('%s', 'now'))",
                [CURRENT_SCHEMA_VERSION],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_health_records_table(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS health_records (
                record_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                patient_id TEXT NOT NULL,
                provider_id TEXT NOT NULL,
                record_type TEXT NOT NULL,
                status TEXT NOT NULL,
                confidentiality TEXT NOT NULL,
                record_date INTEGER NOT NULL,
                encrypted_content BLOB NOT NULL,
                iv BLOB NOT NULL,
                key_version INTEGER NOT NULL,
                metadata TEXT NOT NULL,
                attachments TEXT NOT NULL,
                last_modified INTEGER NOT NULL,
                pending INTEGER NOT NULL DEFAULT 0,
                server_version INTEGER NOT NULL DEFAULT 0,
                superseded INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (record_id, version)
            )",
                [],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_key_versions_table(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS key_versions (
                version INTEGER PRIMARY KEY,
                alias TEXT NOT NULL,
                provider_kind TEXT NOT NULL,
                wrapped_key BLOB,
                created_at INTEGER NOT NULL,
                retired_at INTEGER,
                purged INTEGER NOT NULL DEFAULT 0
            )",
                [],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_sync_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS sync_state (
                    entity_id TEXT PRIMARY KEY,
                    last_sync_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sync_conflicts (
                    conflict_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    record_id TEXT NOT NULL,
                    local_version INTEGER NOT NULL,
                    server_version INTEGER NOT NULL,
                    remote_payload BLOB NOT NULL,
                    remote_iv BLOB NOT NULL,
                    remote_key_version INTEGER NOT NULL,
                    detected_at INTEGER NOT NULL,
                    resolved INTEGER NOT NULL DEFAULT 0
                );",
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_cache_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS cache_refresh (
                    patient_id TEXT PRIMARY KEY,
                    last_refresh INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS wearable_cache (
                    sample_id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    device_id TEXT NOT NULL,
                    metric_code TEXT,
                    recorded_at INTEGER NOT NULL,
                    encrypted_content BLOB NOT NULL,
                    iv BLOB NOT NULL,
                    key_version INTEGER NOT NULL,
                    last_modified INTEGER NOT NULL,
                    pending INTEGER NOT NULL DEFAULT 1
                );",
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_audit_table(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS audit_log (
                audit_id INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at INTEGER NOT NULL,
                severity INTEGER NOT NULL,
                entry TEXT NOT NULL
            )",
                [],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_indexes(&self) -> Result<()> {
        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_health_records_patient ON health_records(patient_id, superseded)",
            "CREATE INDEX IF NOT EXISTS idx_health_records_pending ON health_records(pending)",
            "CREATE INDEX IF NOT EXISTS idx_health_records_key_version ON health_records(key_version)",
            "CREATE INDEX IF NOT EXISTS idx_key_versions_alias ON key_versions(alias)",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_record ON sync_conflicts(record_id, resolved)",
            "CREATE INDEX IF NOT EXISTS idx_wearable_cache_user ON wearable_cache(user_id, recorded_at)",
            "CREATE INDEX IF NOT EXISTS idx_audit_log_severity ON audit_log(severity)",
        ];
        for sql in &indexes {
            self.conn.execute(sql, []).map_err(DatabaseError::Sqlite)?;
        }
        Ok(())
    }

    /// Validate the database schema version.
    pub fn validate_schema_version(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .query_row("SELECT version FROM db_metadata WHERE id = 1", [], |row| {
                row.get(0)
            })
            .map_err(DatabaseError::Sqlite)?;

        if version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        Err(DatabaseError::SchemaMismatch {
            expected: CURRENT_SCHEMA_VERSION,
            found: version,
        }
        .into())
    }

    /// Get a reference to the underlying connection
    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(db: &Database, kind: &str) -> Vec<String> {
        db.conn
            .prepare("SELECT name FROM sqlite_master WHERE type = ?1")
            .unwrap()
            .query_map([kind], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_in_memory_database() {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();

        let tables = names(&db, "table");
        for table in [
            "db_metadata",
            "health_records",
            "key_versions",
            "sync_state",
            "sync_conflicts",
            "cache_refresh",
            "wearable_cache",
            "audit_log",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }

        let indexes = names(&db, "index");
        assert!(indexes.contains(&"idx_health_records_patient".to_string()));
        assert!(indexes.contains(&"idx_health_records_pending".to_string()));
    }

    #[test]
    fn test_schema_initialization_is_idempotent() {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        db.initialize_schema().unwrap();
        db.validate_schema_version().unwrap();
    }

    #[test]
    fn test_future_schema_version_rejected() {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        db.conn
            .execute("UPDATE db_metadata SET version = 99 WHERE id = 1", [])
            .unwrap();

        assert!(db.validate_schema_version().is_err());
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");

        {
            let db = Database::open_initialized(&path).unwrap();
            db.conn
                .execute(
                    "INSERT INTO sync_state (entity_id, last_sync_at) VALUES ('p1', 10)",
                    [],
                )
                .unwrap();
        }

        let db = Database::open_initialized(&path).unwrap();
        let at: i64 = db
            .conn
            .query_row(
                "SELECT last_sync_at FROM sync_state WHERE entity_id = 'p1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(at, 10);
    }
}
