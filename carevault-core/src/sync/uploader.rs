//! Sequential uploader shared by the repository and the sync manager.

use crate::api::{HealthRecordService, RemoteRecord};
use crate::audit::{AuditEventType, AuditLogger};
use crate::crypto::RecordSealer;
use crate::database::{CachedRecord, RecordCache};
use crate::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Sends cached records to the server one at a time.
pub struct RecordUploader {
    service: Arc<dyn HealthRecordService>,
    cache: RecordCache,
    sealer: RecordSealer,
    audit: AuditLogger,
    lock: Mutex<()>,
}

impl RecordUploader {
    pub fn new(
        service: Arc<dyn HealthRecordService>,
        cache: RecordCache,
        sealer: RecordSealer,
        audit: AuditLogger,
    ) -> Self {
        Self {
            service,
            cache,
            sealer,
            audit,
            lock: Mutex::new(()),
        }
    }

    pub fn service(&self) -> &Arc<dyn HealthRecordService> {
        &self.service
    }

    /// Upload one cached version and mark it synced.
    ///
    /// The row stays pending when the call fails.
    pub async fn upload_cached(&self, row: &CachedRecord) -> Result<RemoteRecord> {
        let record = self.sealer.open(row.clone())?;

        let _guard = self.lock.lock().await;
        debug!(record_id = %row.record_id, version = row.version, "Uploading record");
        let remote = self.service.upload_record(&record).await?;

        self.cache
            .mark_synced(row, remote.server_version)?;
        self.audit.log(
            AuditEventType::RecordUploaded {
                record_id: row.record_id.clone(),
                server_version: remote.server_version,
            },
            "upload",
        )?;
        info!(
            record_id = %row.record_id,
            server_version = remote.server_version,
            "Record uploaded"
        );
        Ok(remote)
    }
}

#[cfg(test)]
mod tests {
    use crate::api::ApiError;
    use crate::testing::{sample_record, Harness};
    use crate::CareError;

    #[tokio::test]
    async fn upload_marks_row_synced_and_audits() {
        let harness = Harness::new();
        let record = sample_record("p1");
        let row = harness.sealer.seal(&record, true).unwrap();
        harness.cache.insert(&row).unwrap();

        let remote = harness.uploader.upload_cached(&row).await.unwrap();
        assert_eq!(remote.record.id, record.id);
        assert!(harness.cache.get_pending("p1").unwrap().is_empty());
        assert_eq!(
            harness.cache.get_by_id(&record.id).unwrap().unwrap().server_version,
            remote.server_version
        );
        assert_eq!(harness.audit.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_upload_leaves_row_pending() {
        let harness = Harness::new();
        let row = harness.sealer.seal(&sample_record("p1"), true).unwrap();
        harness.cache.insert(&row).unwrap();
        harness
            .service
            .set_failing(Some(ApiError::Network("timeout".into())));

        let err = harness.uploader.upload_cached(&row).await.unwrap_err();
        assert!(matches!(err, CareError::Network(_)));
        assert_eq!(harness.cache.get_pending("p1").unwrap().len(), 1);
        assert_eq!(harness.audit.count().unwrap(), 0);
    }
}
