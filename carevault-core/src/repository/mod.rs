//! Repository: the entry point applications use for health records.
//!
//! Reads are cache-first and stream their results through a
//! [`Subscription`]. Uploads are validated, written to the cache as pending,
//! and then sent through the shared uploader when the device is online.

use crate::api::{ConnectivityMonitor, RemoteRecord};
use crate::audit::AuditEventType;
use crate::crypto::CryptoError;
use crate::database::cache::MAX_ACCESS_HISTORY;
use crate::database::{CachedRecord, RecordPage, RecordQuery, UpdateOutcome};
use crate::observable::{self, Publisher, Subscription};
use crate::records::{
    AccessAction, AccessEvent, HealthRecord, RecordStatus, RecordType, RecordValidator,
    WearableSource,
};
use crate::sync::{SyncManager, SyncReport};
use crate::{CareError, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which records to read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFilter {
    pub patient_id: String,
    pub record_type: Option<RecordType>,
    pub status: Option<RecordStatus>,
    /// Go to the network even when the cache is fresh
    pub force_refresh: bool,
}

impl RecordFilter {
    pub fn for_patient(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            record_type: None,
            status: None,
            force_refresh: false,
        }
    }

    fn query(&self) -> RecordQuery {
        RecordQuery {
            patient_id: self.patient_id.clone(),
            record_type: self.record_type,
            status: self.status,
        }
    }
}

/// Events emitted by [`Repository::get_records`]
#[derive(Debug)]
pub enum RecordsEvent {
    /// Decrypted page served from the local cache
    Cached(RecordPage<HealthRecord>),
    /// Page after merging the server's copy
    Fresh(RecordPage<HealthRecord>),
    /// The network failed after cached data was served
    Offline,
    /// Nothing could be served
    Failed(CareError),
}

/// States emitted by [`Repository::upload`]
#[derive(Debug)]
pub enum UploadState {
    Uploading,
    Success(RemoteRecord),
    /// Stored locally, waiting for the next sync
    Pending,
    Error(CareError),
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Uploading)
    }
}

/// Cache-first access to health records
#[derive(Clone)]
pub struct Repository {
    sync: Arc<SyncManager>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    validator: RecordValidator,
    actor: String,
}

impl Repository {
    pub fn new(
        sync: Arc<SyncManager>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        validator: RecordValidator,
    ) -> Self {
        Self {
            sync,
            connectivity,
            validator,
            actor: "local-user".to_string(),
        }
    }

    /// Identity written into access events and audit entries.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn sync_manager(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    /// Stream a page of records: cached first, then fresh when needed.
    pub fn get_records(
        &self,
        filter: RecordFilter,
        page: u32,
        page_size: u32,
    ) -> Subscription<RecordsEvent> {
        let (publisher, subscription) = observable::channel();
        let repo = self.clone();
        tokio::spawn(async move {
            repo.read_records(filter, page, page_size, publisher).await;
        });
        subscription
    }

    async fn read_records(
        &self,
        filter: RecordFilter,
        page: u32,
        page_size: u32,
        publisher: Publisher<RecordsEvent>,
    ) {
        let cache = self.sync.cache();
        let query = filter.query();

        let cached = match cache
            .query(&query, page, page_size)
            .and_then(|rows| rows.try_map(|row| self.open_viewed(row)))
        {
            Ok(cached) => cached,
            Err(e) => {
                publisher.emit(RecordsEvent::Failed(e)).await;
                return;
            }
        };

        let had_cached = !cached.is_empty();
        if had_cached && !publisher.emit(RecordsEvent::Cached(cached)).await {
            return;
        }

        let expired = match cache.cache_state(&filter.patient_id) {
            Ok(state) => state.expired,
            Err(e) => {
                warn!(error = %e, "Could not read cache state");
                true
            }
        };
        if had_cached && !expired && !filter.force_refresh {
            return;
        }
        if publisher.is_closed() {
            debug!(patient_id = %filter.patient_id, "Reader gone, skipping fetch");
            return;
        }

        let event = match self.fetch_fresh(&filter, &query, page, page_size).await {
            Ok(fresh) => RecordsEvent::Fresh(fresh),
            Err(e) if had_cached && e.is_offline() => {
                debug!(error = %e, "Serving cached records offline");
                RecordsEvent::Offline
            }
            Err(e) => RecordsEvent::Failed(e),
        };
        publisher.emit(event).await;
    }

    async fn fetch_fresh(
        &self,
        filter: &RecordFilter,
        query: &RecordQuery,
        page: u32,
        page_size: u32,
    ) -> Result<RecordPage<HealthRecord>> {
        if !self.connectivity.is_online() {
            return Err(CareError::Network("device is offline".to_string()));
        }

        let remote = self
            .sync
            .uploader()
            .service()
            .fetch_page(&filter.patient_id, page, page_size)
            .await?;
        let outcome = self.sync.merge_remote(&remote)?;
        debug!(
            patient_id = %filter.patient_id,
            fetched = remote.len(),
            merged = outcome.merged,
            "Merged fetched page"
        );

        let cache = self.sync.cache();
        cache.touch_refresh(&filter.patient_id)?;
        cache
            .query(query, page, page_size)?
            .try_map(|row| self.open_viewed(row))
    }

    /// Decrypt a row and record that it was viewed.
    fn open_viewed(&self, row: CachedRecord) -> Result<HealthRecord> {
        let record_id = row.record_id.clone();
        let mut record = self.sync.sealer().open(row)?;

        let event = AccessEvent {
            actor: self.actor.clone(),
            action: AccessAction::Viewed,
            at: Utc::now(),
        };
        self.sync.cache().append_access(&record_id, &event)?;
        let history = &mut record.metadata.access_history;
        history.push(event);
        let overflow = history.len().saturating_sub(MAX_ACCESS_HISTORY);
        history.drain(..overflow);

        self.sync.audit().log(
            AuditEventType::RecordViewed {
                record_id,
                actor: self.actor.clone(),
            },
            "read",
        )?;
        Ok(record)
    }

    /// Validate, cache and upload a record.
    ///
    /// Dropping the subscription does not cancel the upload.
    pub fn upload(&self, record: HealthRecord) -> Subscription<UploadState> {
        let (publisher, subscription) = observable::channel();
        let repo = self.clone();
        tokio::spawn(async move {
            publisher.emit(UploadState::Uploading).await;
            let state = match repo.upload_record(record).await {
                Ok(state) => state,
                Err(e) => UploadState::Error(e),
            };
            publisher.emit(state).await;
        });
        subscription
    }

    async fn upload_record(&self, record: HealthRecord) -> Result<UploadState> {
        self.validator.validate(&record)?;

        let cache = self.sync.cache();
        let row = self.seal_local(&record)?;
        if cache.upsert_local(&row)?.is_none() {
            self.sync.audit().log(
                AuditEventType::RecordCreated {
                    record_id: record.id.clone(),
                },
                "upload",
            )?;
        }

        if !self.connectivity.is_online() {
            info!(record_id = %record.id, "Offline, record queued for sync");
            return Ok(UploadState::Pending);
        }

        let latest = cache
            .get_by_id(&record.id)?
            .ok_or_else(|| CareError::NotFound(format!("record {}", record.id)))?;
        match self.sync.uploader().upload_cached(&latest).await {
            Ok(remote) => Ok(UploadState::Success(remote)),
            Err(e) if e.is_offline() => {
                info!(record_id = %record.id, error = %e, "Upload deferred, record queued for sync");
                Ok(UploadState::Pending)
            }
            Err(e) => Err(e),
        }
    }

    /// Run one sync cycle for every patient with cached records.
    pub async fn refresh(&self) -> Result<Vec<SyncReport>> {
        let patients = self.sync.cache().patients()?;
        self.sync.sync_entities(&patients).await
    }

    /// Latest version of a record, decrypted.
    pub fn get_record(&self, record_id: &str) -> Result<HealthRecord> {
        let row = self
            .sync
            .cache()
            .get_by_id(record_id)?
            .ok_or_else(|| CareError::NotFound(format!("record {}", record_id)))?;
        self.open_viewed(row)
    }

    /// Store a local edit and queue it for sync.
    ///
    /// Edits to `final` or `deleted` records become a new version.
    pub fn update_record(&self, record: &HealthRecord) -> Result<UpdateOutcome> {
        self.validator.validate(record)?;

        let row = self.seal_local(record)?;
        let outcome = self.sync.cache().update(&row)?;
        self.sync.mark_for_sync(&record.id)?;

        self.sync.audit().log(
            AuditEventType::RecordUpdated {
                record_id: record.id.clone(),
                version: row.version,
            },
            "update",
        )?;
        Ok(outcome)
    }

    /// Seal a local write for the version it will be stored as.
    fn seal_local(&self, record: &HealthRecord) -> Result<CachedRecord> {
        match self.sync.cache().next_local_version(&record.id)? {
            Some(version) if version != record.metadata.version => {
                let mut record = record.clone();
                record.metadata.version = version;
                self.sync.sealer().seal(&record, true)
            }
            _ => self.sync.sealer().seal(record, true),
        }
    }

    /// Rotate the record key, then migrate cached rows to the new version.
    ///
    /// Returns the new key version and the number of migrated rows.
    pub fn rotate_key(&self) -> Result<(Option<u32>, usize)> {
        let version = self.rotate_alias(self.sync.sealer().alias())?;
        let migrated = self.reencrypt_stale_records()?;
        Ok((version, migrated))
    }

    /// Rotate any key alias and audit it. Cached rows are not touched.
    pub fn rotate_alias(&self, alias: &str) -> Result<Option<u32>> {
        let crypto = self.sync.sealer().crypto();
        crypto.rotate_key(alias)?;
        let version = crypto.current_version(alias)?;
        self.sync.audit().log(
            AuditEventType::KeyRotated {
                alias: alias.to_string(),
                version,
            },
            "rotate",
        )?;
        Ok(version)
    }

    /// Destroy key versions whose grace period ended.
    ///
    /// Cached data still under those versions is migrated first.
    pub fn purge_expired_keys(&self) -> Result<usize> {
        self.reencrypt_stale_records()?;
        let purged = self.sync.sealer().crypto().purge_expired_keys()?;
        self.sync
            .audit()
            .log(AuditEventType::KeysPurged { count: purged }, "purge")?;
        Ok(purged)
    }

    /// Move everything encrypted under retired key versions to the current
    /// version: record rows, wearable samples and stored conflict copies.
    ///
    /// Data whose key was already purged cannot be read and is skipped.
    pub fn reencrypt_stale_records(&self) -> Result<usize> {
        let sealer = self.sync.sealer();
        let Some(current) = sealer.crypto().current_version(sealer.alias())? else {
            return Ok(0);
        };

        let cache = self.sync.cache();
        let mut migrated = 0;
        for row in cache.stale_key_rows(current)? {
            match skip_purged(sealer.reseal(&row))? {
                Some(content) => {
                    cache.replace_content(&row.record_id, row.version, &content)?;
                    migrated += 1;
                }
                None => warn!(
                    record_id = %row.record_id,
                    version = row.version,
                    key_version = row.content.key_version,
                    "Key purged before migration, row unreadable"
                ),
            }
        }

        for row in cache.stale_wearable_rows(current)? {
            match skip_purged(sealer.reseal_metric(&row))? {
                Some(content) => {
                    cache.replace_wearable_content(&row.sample_id, &content)?;
                    migrated += 1;
                }
                None => warn!(
                    sample_id = %row.sample_id,
                    key_version = row.content.key_version,
                    "Key purged before migration, wearable sample unreadable"
                ),
            }
        }

        migrated += self.sync.reencrypt_conflicts(current)?;

        if migrated > 0 {
            info!(migrated, key_version = current, "Re-encrypted cached data");
        }
        Ok(migrated)
    }

    /// Pull new wearable samples and cache their coded metrics encrypted.
    pub async fn ingest_wearables(&self, source: &dyn WearableSource, user_id: &str) -> Result<usize> {
        let cache = self.sync.cache();
        let since = cache.latest_wearable_at(user_id)?;
        let samples = source.pull(user_id, since).await?;

        let sealer = self.sync.sealer();
        let rows = samples
            .iter()
            .flat_map(|sample| sample.to_metrics())
            .map(|metric| sealer.seal_metric(&metric))
            .collect::<Result<Vec<_>>>()?;
        let inserted = cache.insert_wearables(&rows)?;

        self.sync.audit().log(
            AuditEventType::WearablesIngested {
                user_id: user_id.to_string(),
                count: inserted,
            },
            "wearables",
        )?;
        info!(samples = samples.len(), metrics = inserted, "Wearable samples ingested");
        Ok(inserted)
    }
}

/// `Ok(None)` for data whose key version was purged.
fn skip_purged<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(CareError::Security(CryptoError::KeyExpired(_))) => Ok(None),
        Err(e) => Err(e),
    }
}
