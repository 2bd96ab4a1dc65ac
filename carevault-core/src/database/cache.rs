//! Encrypted record cache (DAO).
//!
//! Rows arrive already encrypted. The cache never decrypts and never talks to
//! the network; it only answers queries and tracks which rows are pending.

use crate::config::CacheConfig;
use crate::crypto::cipher::IV_LEN;
use crate::crypto::EncryptedData;
use crate::database::models::{
    CacheState, CachedRecord, CachedWearable, RecordPage, RecordQuery, UpdateOutcome,
};
use crate::database::Database;
use crate::records::{AccessEvent, RecordMetadata, RecordStatus};
use crate::{CareError, DatabaseError, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

const RECORD_COLUMNS: &str = "record_id, version, patient_id, provider_id, record_type, status, \
     confidentiality, record_date, encrypted_content, iv, key_version, metadata, attachments, \
     last_modified, pending, server_version";

/// Access events kept in a record's metadata
pub const MAX_ACCESS_HISTORY: usize = 20;

/// DAO over the `health_records`, `cache_refresh` and `wearable_cache` tables
#[derive(Clone)]
pub struct RecordCache {
    db: Arc<Mutex<Database>>,
    max_page_size: u32,
    ttl_secs: i64,
}

impl RecordCache {
    pub fn new(db: Arc<Mutex<Database>>, config: &CacheConfig) -> Self {
        Self {
            db,
            max_page_size: config.max_page_size.max(1),
            ttl_secs: config.ttl_secs,
        }
    }

    fn lock(&self, context: &str) -> Result<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned(context.to_string()).into())
    }

    /// Insert a new record version.
    pub fn insert(&self, row: &CachedRecord) -> Result<()> {
        let db = self.lock("insert")?;
        let tx = db.conn().unchecked_transaction()?;
        write_row(&tx, row, false)?;
        refresh_superseded(&tx, &row.record_id)?;
        tx.commit()?;
        debug!(record_id = %row.record_id, version = row.version, "Cached record");
        Ok(())
    }

    /// Latest version of a record
    pub fn get_by_id(&self, record_id: &str) -> Result<Option<CachedRecord>> {
        let db = self.lock("get_by_id")?;
        let sql = format!(
            "SELECT {} FROM health_records WHERE record_id = ?1 ORDER BY version DESC LIMIT 1",
            RECORD_COLUMNS
        );
        Ok(db
            .conn()
            .query_row(&sql, [record_id], row_to_cached)
            .optional()?)
    }

    /// A specific version of a record
    pub fn get_version(&self, record_id: &str, version: u32) -> Result<Option<CachedRecord>> {
        let db = self.lock("get_version")?;
        let sql = format!(
            "SELECT {} FROM health_records WHERE record_id = ?1 AND version = ?2",
            RECORD_COLUMNS
        );
        Ok(db
            .conn()
            .query_row(&sql, params![record_id, version], row_to_cached)
            .optional()?)
    }

    /// Every stored version of a record, oldest first
    pub fn get_version_history(&self, record_id: &str) -> Result<Vec<CachedRecord>> {
        let db = self.lock("get_version_history")?;
        let sql = format!(
            "SELECT {} FROM health_records WHERE record_id = ?1 ORDER BY version ASC",
            RECORD_COLUMNS
        );
        collect_rows(db.conn(), &sql, [record_id])
    }

    pub fn get_by_patient(
        &self,
        patient_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<RecordPage<CachedRecord>> {
        self.query(&RecordQuery::for_patient(patient_id), page, page_size)
    }

    /// Page through the latest versions matching `query`, newest first.
    ///
    /// `page_size` is clamped to `1..=max_page_size`.
    pub fn query(
        &self,
        query: &RecordQuery,
        page: u32,
        page_size: u32,
    ) -> Result<RecordPage<CachedRecord>> {
        let limit = page_size.clamp(1, self.max_page_size) as usize;
        let offset = page as usize * limit;
        let record_type = query.record_type.map(|t| t.as_str());
        let status = query.status.map(|s| s.as_str());

        let db = self.lock("query")?;
        let conn = db.conn();

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM health_records
             WHERE patient_id = ?1 AND superseded = 0
               AND (?2 IS NULL OR record_type = ?2)
               AND (?3 IS NULL OR status = ?3)",
            params![query.patient_id, record_type, status],
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {} FROM health_records
             WHERE patient_id = ?1 AND superseded = 0
               AND (?2 IS NULL OR record_type = ?2)
               AND (?3 IS NULL OR status = ?3)
             ORDER BY record_date DESC, record_id ASC
             LIMIT ?4 OFFSET ?5",
            RECORD_COLUMNS
        );
        let items = collect_rows(
            conn,
            &sql,
            params![
                query.patient_id,
                record_type,
                status,
                limit as i64,
                offset as i64
            ],
        )?;

        Ok(RecordPage::new(items, total as usize, offset, limit))
    }

    /// Latest versions of a patient's records not yet acknowledged by the server, oldest first
    pub fn get_pending(&self, patient_id: &str) -> Result<Vec<CachedRecord>> {
        let db = self.lock("get_pending")?;
        let sql = format!(
            "SELECT {} FROM health_records
             WHERE patient_id = ?1 AND pending = 1 AND superseded = 0
             ORDER BY last_modified ASC, record_id ASC",
            RECORD_COLUMNS
        );
        collect_rows(db.conn(), &sql, [patient_id])
    }

    pub fn count_pending(&self, patient_id: Option<&str>) -> Result<u64> {
        let db = self.lock("count_pending")?;
        let count: i64 = db.conn().query_row(
            "SELECT COUNT(*) FROM health_records
             WHERE pending = 1 AND superseded = 0 AND (?1 IS NULL OR patient_id = ?1)",
            [patient_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Patients with at least one cached record
    pub fn patients(&self) -> Result<Vec<String>> {
        let db = self.lock("patients")?;
        let mut stmt = db
            .conn()
            .prepare("SELECT DISTINCT patient_id FROM health_records ORDER BY patient_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Version a local edit of `record_id` is stored as, or `None` for a new record.
    ///
    /// Rows must be sealed for this version before [`update`](Self::update).
    pub fn next_local_version(&self, record_id: &str) -> Result<Option<u32>> {
        let db = self.lock("next_local_version")?;
        Ok(latest_state(db.conn(), record_id)?.map(|latest| latest.next_local_version()))
    }

    /// Write a local modification.
    ///
    /// A `final` or `deleted` latest version is never rewritten; the change is
    /// stored as version + 1 instead. `row.version` must already be that
    /// version, otherwise the record changed underneath the caller and the
    /// write is refused with a conflict. The written row is always pending and
    /// keeps the server version it was based on.
    pub fn update(&self, row: &CachedRecord) -> Result<UpdateOutcome> {
        let db = self.lock("update")?;
        let tx = db.conn().unchecked_transaction()?;
        let Some(latest) = latest_state(&tx, &row.record_id)? else {
            return Err(CareError::NotFound(format!("record {}", row.record_id)));
        };
        let outcome = update_in(&tx, row, &latest)?;
        tx.commit()?;
        debug!(record_id = %row.record_id, ?outcome, "Updated cached record");
        Ok(outcome)
    }

    /// Insert a new record or update the existing one in a single transaction.
    ///
    /// Returns `None` when the record was created.
    pub fn upsert_local(&self, row: &CachedRecord) -> Result<Option<UpdateOutcome>> {
        let db = self.lock("upsert_local")?;
        let tx = db.conn().unchecked_transaction()?;
        let outcome = match latest_state(&tx, &row.record_id)? {
            Some(latest) => Some(update_in(&tx, row, &latest)?),
            None => {
                let mut created = row.clone();
                created.pending = true;
                write_row(&tx, &created, false)?;
                refresh_superseded(&tx, &created.record_id)?;
                None
            }
        };
        tx.commit()?;
        debug!(record_id = %row.record_id, ?outcome, "Stored local record");
        Ok(outcome)
    }

    /// Apply a server copy of a record.
    ///
    /// With `discard_local`, local versions newer than the server copy are
    /// dropped so the server copy becomes the latest version.
    pub fn upsert_from_server(&self, row: &CachedRecord, discard_local: bool) -> Result<()> {
        let db = self.lock("upsert_from_server")?;
        let tx = db.conn().unchecked_transaction()?;
        if discard_local {
            tx.execute(
                "DELETE FROM health_records WHERE record_id = ?1 AND version > ?2",
                params![row.record_id, row.version],
            )?;
        }
        write_row(&tx, row, true)?;
        refresh_superseded(&tx, &row.record_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Record the server's acknowledgement of an uploaded snapshot.
    ///
    /// Pending is cleared only when the row still holds the uploaded ciphertext.
    /// A row rewritten while the upload was in flight keeps pending and only
    /// takes the new server version. Returns whether pending was cleared.
    pub fn mark_synced(&self, uploaded: &CachedRecord, server_version: i64) -> Result<bool> {
        let db = self.lock("mark_synced")?;
        let tx = db.conn().unchecked_transaction()?;
        let stored_iv: Option<Vec<u8>> = tx
            .query_row(
                "SELECT iv FROM health_records WHERE record_id = ?1 AND version = ?2",
                params![uploaded.record_id, uploaded.version],
                |row| row.get(0),
            )
            .optional()?;
        let Some(stored_iv) = stored_iv else {
            return Err(CareError::NotFound(format!(
                "record {} v{}",
                uploaded.record_id, uploaded.version
            )));
        };

        let unchanged = stored_iv.as_slice() == uploaded.content.iv.as_slice();
        tx.execute(
            "UPDATE health_records SET pending = CASE WHEN ?4 THEN 0 ELSE pending END,
                 server_version = ?3
             WHERE record_id = ?1 AND version = ?2",
            params![uploaded.record_id, uploaded.version, server_version, unchanged],
        )?;
        tx.execute(
            "UPDATE health_records SET pending = 0 WHERE record_id = ?1 AND version < ?2",
            params![uploaded.record_id, uploaded.version],
        )?;
        tx.commit()?;
        if !unchanged {
            debug!(
                record_id = %uploaded.record_id,
                version = uploaded.version,
                "Row changed during upload, left pending"
            );
        }
        Ok(unchanged)
    }

    /// Treat the latest version as based on `server_version` without clearing pending.
    pub fn acknowledge_server_version(&self, record_id: &str, server_version: i64) -> Result<bool> {
        let db = self.lock("acknowledge_server_version")?;
        let changed = db.conn().execute(
            "UPDATE health_records SET server_version = ?2
             WHERE record_id = ?1 AND superseded = 0",
            params![record_id, server_version],
        )?;
        Ok(changed > 0)
    }

    /// Flag the latest version of a record for upload. Returns false for unknown records.
    pub fn mark_pending(&self, record_id: &str) -> Result<bool> {
        let db = self.lock("mark_pending")?;
        let changed = db.conn().execute(
            "UPDATE health_records SET pending = 1
             WHERE record_id = ?1 AND superseded = 0",
            [record_id],
        )?;
        Ok(changed > 0)
    }

    /// Append to the access history of the latest version without touching content.
    ///
    /// Only the newest [`MAX_ACCESS_HISTORY`] events are kept; the audit log
    /// holds the full trail.
    pub fn append_access(&self, record_id: &str, event: &AccessEvent) -> Result<()> {
        let db = self.lock("append_access")?;
        let tx = db.conn().unchecked_transaction()?;
        let current: Option<(u32, String)> = tx
            .query_row(
                "SELECT version, metadata FROM health_records
                 WHERE record_id = ?1 ORDER BY version DESC LIMIT 1",
                [record_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((version, metadata)) = current else {
            return Err(CareError::NotFound(format!("record {}", record_id)));
        };

        let mut metadata: RecordMetadata = serde_json::from_str(&metadata)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        metadata.access_history.push(event.clone());
        let overflow = metadata
            .access_history
            .len()
            .saturating_sub(MAX_ACCESS_HISTORY);
        metadata.access_history.drain(..overflow);
        let metadata = serde_json::to_string(&metadata)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        tx.execute(
            "UPDATE health_records SET metadata = ?3 WHERE record_id = ?1 AND version = ?2",
            params![record_id, version, metadata],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Every row, current or historical, not encrypted under `current_key_version`
    pub fn stale_key_rows(&self, current_key_version: u32) -> Result<Vec<CachedRecord>> {
        let db = self.lock("stale_key_rows")?;
        let sql = format!(
            "SELECT {} FROM health_records WHERE key_version <> ?1
             ORDER BY record_id ASC, version ASC",
            RECORD_COLUMNS
        );
        collect_rows(db.conn(), &sql, [current_key_version])
    }

    /// Swap the ciphertext of one row after re-encryption. Pending state is untouched.
    pub fn replace_content(
        &self,
        record_id: &str,
        version: u32,
        content: &EncryptedData,
    ) -> Result<()> {
        let db = self.lock("replace_content")?;
        db.conn().execute(
            "UPDATE health_records SET encrypted_content = ?3, iv = ?4, key_version = ?5
             WHERE record_id = ?1 AND version = ?2",
            params![
                record_id,
                version,
                content.ciphertext,
                content.iv.as_slice(),
                content.key_version
            ],
        )?;
        Ok(())
    }

    pub fn cache_state(&self, patient_id: &str) -> Result<CacheState> {
        self.cache_state_at(patient_id, Utc::now())
    }

    pub fn cache_state_at(&self, patient_id: &str, now: DateTime<Utc>) -> Result<CacheState> {
        let db = self.lock("cache_state")?;
        let last: Option<i64> = db
            .conn()
            .query_row(
                "SELECT last_refresh FROM cache_refresh WHERE patient_id = ?1",
                [patient_id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(match last {
            Some(secs) => CacheState {
                last_refresh: Utc.timestamp_opt(secs, 0).single(),
                expired: now.timestamp() - secs > self.ttl_secs,
            },
            None => CacheState {
                last_refresh: None,
                expired: true,
            },
        })
    }

    /// Record that a patient's records were just fetched from the network.
    pub fn touch_refresh(&self, patient_id: &str) -> Result<()> {
        let db = self.lock("touch_refresh")?;
        db.conn().execute(
            "INSERT INTO cache_refresh (patient_id, last_refresh) VALUES (?1, ?2)
             ON CONFLICT(patient_id) DO UPDATE SET last_refresh = excluded.last_refresh",
            params![patient_id, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Store encrypted wearable metrics. Already cached samples are skipped.
    pub fn insert_wearables(&self, rows: &[CachedWearable]) -> Result<usize> {
        let db = self.lock("insert_wearables")?;
        let tx = db.conn().unchecked_transaction()?;
        let mut inserted = 0;
        for row in rows {
            inserted += tx.execute(
                "INSERT OR IGNORE INTO wearable_cache
                 (sample_id, user_id, device_id, metric_code, recorded_at,
                  encrypted_content, iv, key_version, last_modified, pending)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    row.sample_id,
                    row.user_id,
                    row.device_id,
                    row.metric_code,
                    row.recorded_at.timestamp(),
                    row.content.ciphertext,
                    row.content.iv.as_slice(),
                    row.content.key_version,
                    row.content.timestamp.timestamp(),
                    row.pending
                ],
            )?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Wearable rows not encrypted under `current_key_version`
    pub fn stale_wearable_rows(&self, current_key_version: u32) -> Result<Vec<CachedWearable>> {
        let db = self.lock("stale_wearable_rows")?;
        let mut stmt = db.conn().prepare(
            "SELECT sample_id, user_id, device_id, metric_code, recorded_at,
                    encrypted_content, iv, key_version, last_modified, pending
             FROM wearable_cache WHERE key_version <> ?1 ORDER BY sample_id",
        )?;
        let rows = stmt
            .query_map([current_key_version], row_to_wearable)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Swap the ciphertext of one wearable row after re-encryption.
    pub fn replace_wearable_content(&self, sample_id: &str, content: &EncryptedData) -> Result<()> {
        let db = self.lock("replace_wearable_content")?;
        db.conn().execute(
            "UPDATE wearable_cache SET encrypted_content = ?2, iv = ?3, key_version = ?4
             WHERE sample_id = ?1",
            params![
                sample_id,
                content.ciphertext,
                content.iv.as_slice(),
                content.key_version
            ],
        )?;
        Ok(())
    }

    pub fn count_wearables(&self, user_id: &str) -> Result<u64> {
        let db = self.lock("count_wearables")?;
        let count: i64 = db.conn().query_row(
            "SELECT COUNT(*) FROM wearable_cache WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Most recent wearable sample time for a user
    pub fn latest_wearable_at(&self, user_id: &str) -> Result<Option<DateTime<Utc>>> {
        let db = self.lock("latest_wearable_at")?;
        let secs: Option<i64> = db.conn().query_row(
            "SELECT MAX(recorded_at) FROM wearable_cache WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(secs.and_then(|s| Utc.timestamp_opt(s, 0).single()))
    }
}

/// Version and status of the newest stored version of a record
struct LatestVersion {
    version: u32,
    status: RecordStatus,
    server_version: i64,
}

impl LatestVersion {
    fn next_local_version(&self) -> u32 {
        if self.status.is_immutable() {
            self.version + 1
        } else {
            self.version
        }
    }
}

fn latest_state(conn: &Connection, record_id: &str) -> Result<Option<LatestVersion>> {
    let latest: Option<(u32, String, i64)> = conn
        .query_row(
            "SELECT version, status, server_version FROM health_records
             WHERE record_id = ?1 ORDER BY version DESC LIMIT 1",
            [record_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    latest
        .map(|(version, status, server_version)| -> Result<LatestVersion> {
            Ok(LatestVersion {
                version,
                status: RecordStatus::from_str(&status)?,
                server_version,
            })
        })
        .transpose()
}

fn update_in(conn: &Connection, row: &CachedRecord, latest: &LatestVersion) -> Result<UpdateOutcome> {
    let target = latest.next_local_version();
    if row.version != target {
        return Err(CareError::Conflict(format!(
            "record {} is at version {}, edit was prepared for version {}",
            row.record_id, target, row.version
        )));
    }

    let mut next = row.clone();
    next.pending = true;
    next.server_version = latest.server_version;
    next.metadata.version = target;

    if target > latest.version {
        write_row(conn, &next, false)?;
        refresh_superseded(conn, &next.record_id)?;
        Ok(UpdateOutcome::NewVersion(target))
    } else {
        write_row(conn, &next, true)?;
        Ok(UpdateOutcome::InPlace)
    }
}

fn write_row(conn: &Connection, row: &CachedRecord, replace: bool) -> Result<()> {
    let metadata = serde_json::to_string(&row.metadata)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let attachments = serde_json::to_string(&row.attachments)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
    let sql = format!(
        "{} INTO health_records ({}, superseded)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, 0)",
        verb, RECORD_COLUMNS
    );

    conn.execute(
        &sql,
        params![
            row.record_id,
            row.version,
            row.patient_id,
            row.provider_id,
            row.record_type.as_str(),
            row.status.as_str(),
            row.confidentiality.as_str(),
            row.record_date.timestamp(),
            row.content.ciphertext,
            row.content.iv.as_slice(),
            row.content.key_version,
            metadata,
            attachments,
            row.last_modified.timestamp(),
            row.pending,
            row.server_version
        ],
    )?;
    Ok(())
}

/// Only the highest version of a record is current.
fn refresh_superseded(conn: &Connection, record_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE health_records SET superseded = CASE
             WHEN version = (SELECT MAX(version) FROM health_records WHERE record_id = ?1)
             THEN 0 ELSE 1 END
         WHERE record_id = ?1",
        [record_id],
    )?;
    Ok(())
}

fn collect_rows<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<CachedRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, row_to_cached)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn row_to_cached(row: &Row<'_>) -> rusqlite::Result<CachedRecord> {
    let iv: Vec<u8> = row.get(9)?;
    let iv: [u8; IV_LEN] = iv
        .as_slice()
        .try_into()
        .map_err(|_| conversion_error(9, Type::Blob, "IV must be 12 bytes"))?;
    let last_modified = time_column(row, 13)?;

    Ok(CachedRecord {
        record_id: row.get(0)?,
        version: row.get(1)?,
        patient_id: row.get(2)?,
        provider_id: row.get(3)?,
        record_type: text_column(row, 4)?,
        status: text_column(row, 5)?,
        confidentiality: text_column(row, 6)?,
        record_date: time_column(row, 7)?,
        content: EncryptedData {
            ciphertext: row.get(8)?,
            iv,
            key_version: row.get(10)?,
            timestamp: last_modified,
        },
        metadata: json_column(row, 11)?,
        attachments: json_column(row, 12)?,
        last_modified,
        pending: row.get(14)?,
        server_version: row.get(15)?,
    })
}

fn row_to_wearable(row: &Row<'_>) -> rusqlite::Result<CachedWearable> {
    let iv: Vec<u8> = row.get(6)?;
    let iv: [u8; IV_LEN] = iv
        .as_slice()
        .try_into()
        .map_err(|_| conversion_error(6, Type::Blob, "IV must be 12 bytes"))?;

    Ok(CachedWearable {
        sample_id: row.get(0)?,
        user_id: row.get(1)?,
        device_id: row.get(2)?,
        metric_code: row.get(3)?,
        recorded_at: time_column(row, 4)?,
        content: EncryptedData {
            ciphertext: row.get(5)?,
            iv,
            key_version: row.get(7)?,
            timestamp: time_column(row, 8)?,
        },
        pending: row.get(9)?,
    })
}

fn conversion_error<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, err.into())
}

fn text_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, Type::Text, e))
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, Type::Text, e))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(idx)?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| conversion_error(idx, Type::Integer, "timestamp out of range"))
}
