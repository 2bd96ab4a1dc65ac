//! Sync bookkeeping stored in the local database: last sync times and
//! conflicts waiting for manual resolution.

use crate::crypto::cipher::IV_LEN;
use crate::crypto::EncryptedData;
use crate::sync::models::SyncConflict;
use crate::{DatabaseError, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

fn from_secs(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Last completed sync of an entity. `None` if it never synced.
pub fn last_sync_time(conn: &Connection, entity_id: &str) -> Result<Option<DateTime<Utc>>> {
    let secs: Option<i64> = conn
        .query_row(
            "SELECT last_sync_at FROM sync_state WHERE entity_id = ?1",
            [entity_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(DatabaseError::Sqlite)?;
    Ok(secs.and_then(from_secs))
}

/// Save the last sync time of an entity (upsert).
pub fn set_last_sync_time(conn: &Connection, entity_id: &str, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_state (entity_id, last_sync_at) VALUES (?1, ?2)
         ON CONFLICT(entity_id) DO UPDATE SET last_sync_at = excluded.last_sync_at",
        params![entity_id, at.timestamp()],
    )
    .map_err(DatabaseError::Sqlite)?;
    Ok(())
}

pub fn all_sync_times(conn: &Connection) -> Result<Vec<(String, DateTime<Utc>)>> {
    let mut stmt = conn
        .prepare("SELECT entity_id, last_sync_at FROM sync_state ORDER BY entity_id")
        .map_err(DatabaseError::Sqlite)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(DatabaseError::Sqlite)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(DatabaseError::Sqlite)?;

    Ok(rows
        .into_iter()
        .filter_map(|(entity, secs)| from_secs(secs).map(|at| (entity, at)))
        .collect())
}

/// Record a conflict with the encrypted server copy.
///
/// An unresolved conflict for the same record and server version is not
/// duplicated; its id is returned instead and the flag is false.
pub fn insert_conflict(
    conn: &Connection,
    record_id: &str,
    local_version: u32,
    server_version: i64,
    remote: &EncryptedData,
) -> Result<(i64, bool)> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT conflict_id FROM sync_conflicts
             WHERE record_id = ?1 AND server_version = ?2 AND resolved = 0",
            params![record_id, server_version],
            |row| row.get(0),
        )
        .optional()
        .map_err(DatabaseError::Sqlite)?;
    if let Some(id) = existing {
        return Ok((id, false));
    }

    conn.execute(
        "INSERT INTO sync_conflicts
         (record_id, local_version, server_version, remote_payload, remote_iv,
          remote_key_version, detected_at, resolved)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
        params![
            record_id,
            local_version,
            server_version,
            remote.ciphertext,
            remote.iv.as_slice(),
            remote.key_version,
            remote.timestamp.timestamp()
        ],
    )
    .map_err(DatabaseError::Sqlite)?;
    Ok((conn.last_insert_rowid(), true))
}

const CONFLICT_COLUMNS: &str =
    "conflict_id, record_id, local_version, server_version, detected_at, resolved";

fn conflict_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncConflict> {
    let detected: i64 = row.get(4)?;
    Ok(SyncConflict {
        conflict_id: row.get(0)?,
        record_id: row.get(1)?,
        local_version: row.get(2)?,
        server_version: row.get(3)?,
        detected_at: from_secs(detected).unwrap_or_default(),
        resolved: row.get(5)?,
    })
}

/// Conflicts in detection order, optionally including resolved ones.
pub fn list_conflicts(conn: &Connection, include_resolved: bool) -> Result<Vec<SyncConflict>> {
    let sql = format!(
        "SELECT {} FROM sync_conflicts WHERE resolved = 0 OR ?1 ORDER BY conflict_id",
        CONFLICT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(DatabaseError::Sqlite)?;
    let conflicts = stmt
        .query_map([include_resolved], conflict_from_row)
        .map_err(DatabaseError::Sqlite)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(DatabaseError::Sqlite)?;
    Ok(conflicts)
}

/// An unresolved conflict together with the encrypted server copy.
pub fn load_conflict(
    conn: &Connection,
    conflict_id: i64,
) -> Result<Option<(SyncConflict, EncryptedData)>> {
    let sql = format!(
        "SELECT {}, remote_payload, remote_iv, remote_key_version
         FROM sync_conflicts WHERE conflict_id = ?1 AND resolved = 0",
        CONFLICT_COLUMNS
    );
    let loaded = conn
        .query_row(&sql, [conflict_id], |row| {
            let conflict = conflict_from_row(row)?;
            let iv: Vec<u8> = row.get(7)?;
            Ok((conflict, row.get::<_, Vec<u8>>(6)?, iv, row.get::<_, u32>(8)?))
        })
        .optional()
        .map_err(DatabaseError::Sqlite)?;

    let Some((conflict, ciphertext, iv, key_version)) = loaded else {
        return Ok(None);
    };
    let iv: [u8; IV_LEN] = iv.as_slice().try_into().map_err(|_| {
        DatabaseError::Other(format!("conflict {} has a malformed IV", conflict_id))
    })?;
    let payload = EncryptedData {
        ciphertext,
        iv,
        key_version,
        timestamp: conflict.detected_at,
    };
    Ok(Some((conflict, payload)))
}

/// Conflicts whose payload is not under `current_key_version`:
/// `(conflict_id, record_id, server_version, payload)`.
pub fn stale_conflict_payloads(
    conn: &Connection,
    current_key_version: u32,
) -> Result<Vec<(i64, String, i64, EncryptedData)>> {
    let mut stmt = conn
        .prepare(
            "SELECT conflict_id, record_id, server_version, remote_payload, remote_iv,
                    remote_key_version, detected_at
             FROM sync_conflicts WHERE remote_key_version <> ?1 ORDER BY conflict_id",
        )
        .map_err(DatabaseError::Sqlite)?;
    let rows = stmt
        .query_map([current_key_version], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, Vec<u8>>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })
        .map_err(DatabaseError::Sqlite)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(DatabaseError::Sqlite)?;

    rows.into_iter()
        .map(
            |(conflict_id, record_id, server_version, ciphertext, iv, key_version, detected)|
             -> Result<(i64, String, i64, EncryptedData)> {
                let iv: [u8; IV_LEN] = iv.as_slice().try_into().map_err(|_| {
                    DatabaseError::Other(format!("conflict {} has a malformed IV", conflict_id))
                })?;
                let payload = EncryptedData {
                    ciphertext,
                    iv,
                    key_version,
                    timestamp: from_secs(detected).unwrap_or_default(),
                };
                Ok((conflict_id, record_id, server_version, payload))
            },
        )
        .collect()
}

/// Swap a conflict's payload after re-encryption.
pub fn replace_conflict_payload(
    conn: &Connection,
    conflict_id: i64,
    payload: &EncryptedData,
) -> Result<()> {
    conn.execute(
        "UPDATE sync_conflicts SET remote_payload = ?2, remote_iv = ?3, remote_key_version = ?4
         WHERE conflict_id = ?1",
        params![
            conflict_id,
            payload.ciphertext,
            payload.iv.as_slice(),
            payload.key_version
        ],
    )
    .map_err(DatabaseError::Sqlite)?;
    Ok(())
}

/// Returns false if the conflict does not exist or was already resolved.
pub fn mark_conflict_resolved(conn: &Connection, conflict_id: i64) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE sync_conflicts SET resolved = 1 WHERE conflict_id = ?1 AND resolved = 0",
            [conflict_id],
        )
        .map_err(DatabaseError::Sqlite)?;
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        db
    }

    fn payload() -> EncryptedData {
        EncryptedData {
            ciphertext: vec![1, 2, 3],
            iv: [7; IV_LEN],
            key_version: 3,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn sync_time_roundtrip() {
        let db = db();
        assert!(last_sync_time(db.conn(), "p1").unwrap().is_none());

        let first = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        set_last_sync_time(db.conn(), "p1", first).unwrap();
        let later = first + chrono::Duration::minutes(15);
        set_last_sync_time(db.conn(), "p1", later).unwrap();
        set_last_sync_time(db.conn(), "p2", first).unwrap();

        assert_eq!(last_sync_time(db.conn(), "p1").unwrap(), Some(later));
        let all = all_sync_times(db.conn()).unwrap();
        assert_eq!(all, vec![("p1".to_string(), later), ("p2".to_string(), first)]);
    }

    #[test]
    fn conflicts_are_deduplicated_while_unresolved() {
        let db = db();
        let (id, created) = insert_conflict(db.conn(), "r1", 2, 5, &payload()).unwrap();
        assert!(created);
        let (again, created) = insert_conflict(db.conn(), "r1", 2, 5, &payload()).unwrap();
        assert_eq!(id, again);
        assert!(!created);

        assert!(mark_conflict_resolved(db.conn(), id).unwrap());
        assert!(!mark_conflict_resolved(db.conn(), id).unwrap());
        let (_, created) = insert_conflict(db.conn(), "r1", 2, 5, &payload()).unwrap();
        assert!(created);

        assert_eq!(list_conflicts(db.conn(), false).unwrap().len(), 1);
        assert_eq!(list_conflicts(db.conn(), true).unwrap().len(), 2);
    }

    #[test]
    fn load_conflict_restores_payload() {
        let db = db();
        let (id, _) = insert_conflict(db.conn(), "r1", 1, 4, &payload()).unwrap();

        let (conflict, data) = load_conflict(db.conn(), id).unwrap().unwrap();
        assert_eq!(conflict.record_id, "r1");
        assert_eq!(conflict.server_version, 4);
        assert_eq!(data, payload());

        mark_conflict_resolved(db.conn(), id).unwrap();
        assert!(load_conflict(db.conn(), id).unwrap().is_none());
    }

    #[test]
    fn stale_payloads_can_be_replaced() {
        let db = db();
        let (id, _) = insert_conflict(db.conn(), "r1", 1, 4, &payload()).unwrap();

        let stale = stale_conflict_payloads(db.conn(), 5).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0, id);
        assert_eq!(stale[0].2, 4);
        assert!(stale_conflict_payloads(db.conn(), 3).unwrap().is_empty());

        let resealed = EncryptedData {
            key_version: 5,
            ..payload()
        };
        replace_conflict_payload(db.conn(), id, &resealed).unwrap();
        assert!(stale_conflict_payloads(db.conn(), 5).unwrap().is_empty());
        let (_, data) = load_conflict(db.conn(), id).unwrap().unwrap();
        assert_eq!(data.key_version, 5);
    }
}
