//! Conversion between decrypted records and encrypted cache rows.

use crate::api::RemoteRecord;
use crate::crypto::{EncryptedData, EncryptionManager};
use crate::database::{CachedRecord, CachedWearable};
use crate::records::{HealthMetric, HealthRecord, RecordContent};
use crate::Result;
use std::sync::Arc;

/// Seals records under one key alias
#[derive(Clone)]
pub struct RecordSealer {
    crypto: Arc<EncryptionManager>,
    alias: String,
}

impl RecordSealer {
    pub fn new(crypto: Arc<EncryptionManager>, alias: impl Into<String>) -> Self {
        Self {
            crypto,
            alias: alias.into(),
        }
    }

    pub fn crypto(&self) -> &Arc<EncryptionManager> {
        &self.crypto
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Encrypt a record's content into a cache row.
    ///
    /// The ciphertext is bound to the record id and version, so it only opens
    /// in the row it was sealed for.
    pub fn seal(&self, record: &HealthRecord, pending: bool) -> Result<CachedRecord> {
        let aad = record_aad(&record.id, record.metadata.version);
        let content = self
            .crypto
            .encrypt_json(&record.content, &self.alias, aad.as_bytes())?;
        let mut row = CachedRecord::from_record(record, content, pending);
        row.metadata.encrypted = true;
        Ok(row)
    }

    /// Encrypt a server copy. The row is not pending.
    pub fn seal_remote(&self, remote: &RemoteRecord) -> Result<CachedRecord> {
        let mut row = self.seal(&remote.record, false)?;
        row.server_version = remote.server_version;
        Ok(row)
    }

    /// Decrypt a cache row back into a record.
    pub fn open(&self, row: CachedRecord) -> Result<HealthRecord> {
        let aad = record_aad(&row.record_id, row.version);
        let content: RecordContent = self.crypto.decrypt_json(&row.content, aad.as_bytes())?;
        Ok(row.into_record(content))
    }

    /// Re-encrypt a row's content under the alias's current key version.
    pub fn reseal(&self, row: &CachedRecord) -> Result<EncryptedData> {
        let aad = record_aad(&row.record_id, row.version);
        self.crypto.reencrypt(&row.content, &self.alias, aad.as_bytes())
    }

    /// Encrypt one wearable metric. The sample id is stable per device,
    /// metric and time, so re-ingesting a sample is a no-op.
    pub fn seal_metric(&self, metric: &HealthMetric) -> Result<CachedWearable> {
        let sample_id = format!(
            "{}:{}:{}",
            metric.device_id,
            metric.name,
            metric.recorded_at.timestamp_millis()
        );
        let aad = wearable_aad(&sample_id);
        Ok(CachedWearable {
            content: self
                .crypto
                .encrypt_json(metric, &self.alias, aad.as_bytes())?,
            sample_id,
            user_id: metric.user_id.clone(),
            device_id: metric.device_id.clone(),
            metric_code: metric.code.clone(),
            recorded_at: metric.recorded_at,
            pending: true,
        })
    }

    pub fn open_metric(&self, row: &CachedWearable) -> Result<HealthMetric> {
        let aad = wearable_aad(&row.sample_id);
        self.crypto.decrypt_json(&row.content, aad.as_bytes())
    }

    pub fn reseal_metric(&self, row: &CachedWearable) -> Result<EncryptedData> {
        let aad = wearable_aad(&row.sample_id);
        self.crypto.reencrypt(&row.content, &self.alias, aad.as_bytes())
    }

    /// Encrypt the server copy held by a conflict.
    pub fn seal_conflict(&self, remote: &RemoteRecord) -> Result<EncryptedData> {
        let aad = conflict_aad(&remote.record.id, remote.server_version);
        self.crypto.encrypt_json(remote, &self.alias, aad.as_bytes())
    }

    pub fn open_conflict(
        &self,
        record_id: &str,
        server_version: i64,
        payload: &EncryptedData,
    ) -> Result<RemoteRecord> {
        let aad = conflict_aad(record_id, server_version);
        self.crypto.decrypt_json(payload, aad.as_bytes())
    }

    pub fn reseal_conflict(
        &self,
        record_id: &str,
        server_version: i64,
        payload: &EncryptedData,
    ) -> Result<EncryptedData> {
        let aad = conflict_aad(record_id, server_version);
        self.crypto.reencrypt(payload, &self.alias, aad.as_bytes())
    }
}

fn record_aad(record_id: &str, version: u32) -> String {
    format!("record:{}:{}", record_id, version)
}

fn wearable_aad(sample_id: &str) -> String {
    format!("wearable:{}", sample_id)
}

fn conflict_aad(record_id: &str, server_version: i64) -> String {
    format!("conflict:{}:{}", record_id, server_version)
}
