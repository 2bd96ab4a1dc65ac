//! Audit trail for access to protected health information
//!
//! Entries are JSON documents stored in the `audit_log` table. They carry
//! identifiers and counts only, never clinical content.

use crate::database::Database;
use crate::{DatabaseError, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Audit log entry types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    /// Record operations
    RecordCreated {
        record_id: String,
    },
    RecordViewed {
        record_id: String,
        actor: String,
    },
    RecordUpdated {
        record_id: String,
        version: u32,
    },
    RecordUploaded {
        record_id: String,
        server_version: i64,
    },

    /// Key management
    KeyRotated {
        alias: String,
        version: Option<u32>,
    },
    KeysPurged {
        count: usize,
    },

    /// Synchronization
    SyncCompleted {
        entity_id: String,
        uploaded: usize,
        merged: usize,
        conflicts: usize,
    },
    SyncFailed {
        entity_id: String,
        reason: String,
    },

    /// Wearables
    WearablesIngested {
        user_id: String,
        count: usize,
    },
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Timestamp of the event
    pub timestamp: DateTime<Utc>,
    /// Event type
    pub event_type: AuditEventType,
    /// Event severity (0-5, where 5 is most critical)
    pub severity: u8,
    /// Additional context data
    pub context: String,
}

/// Audit logger backed by the local database
#[derive(Clone)]
pub struct AuditLogger {
    db: Arc<Mutex<Database>>,
}

impl AuditLogger {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned("Failed to lock audit log".to_string()).into())
    }

    /// Log an audit event
    pub fn log(&self, event_type: AuditEventType, context: &str) -> Result<()> {
        let severity = Self::severity_for_event(&event_type);

        let entry = AuditEntry {
            timestamp: Utc::now(),
            event_type,
            severity,
            context: context.to_string(),
        };

        let json = serde_json::to_string(&entry).map_err(|e| {
            DatabaseError::Serialization(format!("Failed to serialize audit entry: {}", e))
        })?;

        let db = self.lock()?;
        db.conn().execute(
            "INSERT INTO audit_log (recorded_at, severity, entry) VALUES (?1, ?2, ?3)",
            params![entry.timestamp.timestamp(), severity, json],
        )?;
        debug!(severity, "Audit event recorded");
        Ok(())
    }

    /// Get severity level for an event type (0-5)
    fn severity_for_event(event: &AuditEventType) -> u8 {
        match event {
            // Critical events (5)
            AuditEventType::KeysPurged { .. } => 5,

            // High severity (4)
            AuditEventType::KeyRotated { .. } => 4,

            // Medium-high severity (3)
            AuditEventType::RecordUpdated { .. } | AuditEventType::SyncFailed { .. } => 3,

            // Medium severity (2)
            AuditEventType::RecordCreated { .. } | AuditEventType::RecordViewed { .. } => 2,

            // Low severity (1)
            AuditEventType::RecordUploaded { .. } | AuditEventType::WearablesIngested { .. } => 1,

            // Info (0)
            AuditEventType::SyncCompleted { .. } => 0,
        }
    }

    /// Most recent entries first
    pub fn get_entries(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.query(
            "SELECT entry FROM audit_log ORDER BY audit_id DESC LIMIT ?1",
            params![limit as i64],
        )
    }

    /// Get audit entries since a specific timestamp
    pub fn get_entries_since(&self, since: DateTime<Utc>) -> Result<Vec<AuditEntry>> {
        let entries = self.query(
            "SELECT entry FROM audit_log WHERE recorded_at >= ?1 ORDER BY audit_id ASC",
            params![since.timestamp()],
        )?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.timestamp > since)
            .collect())
    }

    /// Get audit entries by severity level
    pub fn get_entries_by_severity(&self, min_severity: u8) -> Result<Vec<AuditEntry>> {
        self.query(
            "SELECT entry FROM audit_log WHERE severity >= ?1 ORDER BY audit_id ASC",
            params![min_severity],
        )
    }

    /// Number of stored entries
    pub fn count(&self) -> Result<u64> {
        let db = self.lock()?;
        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn query(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<AuditEntry>> {
        let db = self.lock()?;
        let mut stmt = db.conn().prepare(sql)?;
        let lines = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // Entries written by a newer build may not parse; skip them
        Ok(lines
            .iter()
            .filter_map(|line| serde_json::from_str::<AuditEntry>(line).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger() -> AuditLogger {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        AuditLogger::new(Arc::new(Mutex::new(db)))
    }

    #[test]
    fn test_severity_levels() {
        assert_eq!(
            AuditLogger::severity_for_event(&AuditEventType::KeysPurged { count: 1 }),
            5
        );
        assert_eq!(
            AuditLogger::severity_for_event(&AuditEventType::KeyRotated {
                alias: "phi".into(),
                version: Some(2)
            }),
            4
        );
        assert_eq!(
            AuditLogger::severity_for_event(&AuditEventType::RecordViewed {
                record_id: "r1".into(),
                actor: "dr".into()
            }),
            2
        );
        assert_eq!(
            AuditLogger::severity_for_event(&AuditEventType::SyncCompleted {
                entity_id: "p1".into(),
                uploaded: 0,
                merged: 0,
                conflicts: 0
            }),
            0
        );
    }

    #[test]
    fn test_audit_log_and_get_entries() {
        let logger = logger();

        logger
            .log(
                AuditEventType::RecordCreated {
                    record_id: "r1".into(),
                },
                "upload",
            )
            .unwrap();
        logger
            .log(AuditEventType::KeysPurged { count: 2 }, "maintenance")
            .unwrap();

        let entries = logger.get_entries(10).unwrap();
        assert_eq!(entries.len(), 2);
        // Most recent first
        assert!(matches!(entries[0].event_type, AuditEventType::KeysPurged { count: 2 }));
        assert_eq!(entries[1].context, "upload");
    }

    #[test]
    fn test_audit_get_entries_with_limit() {
        let logger = logger();
        for i in 0..5 {
            logger
                .log(
                    AuditEventType::RecordUpdated {
                        record_id: "r1".into(),
                        version: i,
                    },
                    "edit",
                )
                .unwrap();
        }

        assert_eq!(logger.get_entries(2).unwrap().len(), 2);
    }

    #[test]
    fn test_audit_get_entries_since() {
        let logger = logger();
        let before = Utc::now() - chrono::Duration::seconds(2);

        logger
            .log(AuditEventType::KeysPurged { count: 0 }, "purge")
            .unwrap();

        assert_eq!(logger.get_entries_since(before).unwrap().len(), 1);
        let future = Utc::now() + chrono::Duration::seconds(60);
        assert!(logger.get_entries_since(future).unwrap().is_empty());
        assert_eq!(logger.count().unwrap(), 1);
    }

    #[test]
    fn test_audit_get_entries_by_severity() {
        let logger = logger();
        logger
            .log(
                AuditEventType::SyncCompleted {
                    entity_id: "p1".into(),
                    uploaded: 1,
                    merged: 2,
                    conflicts: 0,
                },
                "info event",
            )
            .unwrap();
        logger
            .log(AuditEventType::KeysPurged { count: 1 }, "critical event")
            .unwrap();
        logger
            .log(
                AuditEventType::KeyRotated {
                    alias: "phi".into(),
                    version: Some(2),
                },
                "high event",
            )
            .unwrap();

        assert_eq!(logger.get_entries_by_severity(5).unwrap().len(), 1);
        assert_eq!(logger.get_entries_by_severity(4).unwrap().len(), 2);
        assert_eq!(logger.get_entries_by_severity(0).unwrap().len(), 3);
    }
}
