//! Shared fixtures and fakes for unit tests.

use crate::api::{ApiError, HealthRecordService, RemoteRecord, StaticConnectivity};
use crate::audit::AuditLogger;
use crate::config::CareConfig;
use crate::crypto::mock::MockKeyProvider;
use crate::crypto::{EncryptionManager, RecordSealer};
use crate::database::{Database, RecordCache};
use crate::records::{
    DeviceMetadata, DeviceType, HealthRecord, RecordContent, RecordType, RecordValidator,
    WearableData, WearableSource,
};
use crate::repository::Repository;
use crate::sync::{ConflictPolicy, RecordUploader, SyncManager};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A draft consultation dated an hour ago, to whole-second precision.
pub(crate) fn sample_record(patient_id: &str) -> HealthRecord {
    let mut content = RecordContent::new();
    content.insert("summary".into(), json!("annual checkup"));
    let mut record = HealthRecord::new(patient_id, "dr-smith", RecordType::Consultation, content);
    let date = Utc::now() - ChronoDuration::hours(1);
    record.date = Utc.timestamp_opt(date.timestamp(), 0).unwrap();
    record
}

pub(crate) fn remote_record(record: HealthRecord, server_version: i64) -> RemoteRecord {
    RemoteRecord {
        record,
        server_version,
        updated_at: Utc::now(),
    }
}

pub(crate) fn memory_db() -> Arc<Mutex<Database>> {
    let db = Database::in_memory().unwrap();
    db.initialize_schema().unwrap();
    Arc::new(Mutex::new(db))
}

pub(crate) fn test_sealer() -> RecordSealer {
    let crypto = EncryptionManager::new(
        Arc::new(MockKeyProvider::new_deterministic()),
        memory_db(),
        &CareConfig::default().security,
    )
    .unwrap();
    RecordSealer::new(Arc::new(crypto), "phi-records")
}

/// In-memory record server with scripted failures.
pub(crate) struct FakeRecordService {
    calls: AtomicUsize,
    next_server_version: AtomicI64,
    failing: Mutex<Option<ApiError>>,
    scripted: Mutex<VecDeque<ApiError>>,
    delay: Mutex<Option<Duration>>,
    records: Mutex<Vec<RemoteRecord>>,
}

impl FakeRecordService {
    pub(crate) fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            next_server_version: AtomicI64::new(1),
            failing: Mutex::new(None),
            scripted: Mutex::new(VecDeque::new()),
            delay: Mutex::new(None),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Fail every call with `error` until reset with `None`.
    pub(crate) fn set_failing(&self, error: Option<ApiError>) {
        *self.failing.lock().unwrap() = error;
    }

    /// Fail the next `count` calls with `error`.
    pub(crate) fn fail_next(&self, count: usize, error: ApiError) {
        let mut scripted = self.scripted.lock().unwrap();
        for _ in 0..count {
            scripted.push_back(error.clone());
        }
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Number of calls that reached the server.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Store a record as if another device had uploaded it.
    pub(crate) fn seed_remote(&self, record: HealthRecord, server_version: i64) {
        self.store(remote_record(record, server_version));
    }

    pub(crate) fn remote_records(&self) -> Vec<RemoteRecord> {
        self.records.lock().unwrap().clone()
    }

    fn store(&self, remote: RemoteRecord) {
        let mut records = self.records.lock().unwrap();
        records.retain(|r| r.record.id != remote.record.id);
        records.push(remote);
    }

    async fn begin_call(&self) -> Result<(), ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.scripted.lock().unwrap().pop_front() {
            return Err(error);
        }
        match self.failing.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl HealthRecordService for FakeRecordService {
    async fn upload_record(&self, record: &HealthRecord) -> Result<RemoteRecord, ApiError> {
        self.begin_call().await?;
        let server_version = self.next_server_version.fetch_add(1, Ordering::SeqCst);
        let remote = remote_record(record.clone(), server_version);
        self.store(remote.clone());
        Ok(remote)
    }

    async fn fetch_updated_since(
        &self,
        patient_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRecord>, ApiError> {
        self.begin_call().await?;
        Ok(self
            .remote_records()
            .into_iter()
            .filter(|r| r.record.patient_id == patient_id)
            .filter(|r| since.map_or(true, |since| r.updated_at > since))
            .collect())
    }

    async fn fetch_page(
        &self,
        patient_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<RemoteRecord>, ApiError> {
        self.begin_call().await?;
        let mut records: Vec<_> = self
            .remote_records()
            .into_iter()
            .filter(|r| r.record.patient_id == patient_id)
            .collect();
        records.sort_by(|a, b| b.record.date.cmp(&a.record.date));
        Ok(records
            .into_iter()
            .skip((page * page_size) as usize)
            .take(page_size as usize)
            .collect())
    }
}

/// Wearable platform returning a fixed set of samples.
pub(crate) struct FakeWearableSource {
    samples: Vec<WearableData>,
    pulls: AtomicUsize,
}

impl FakeWearableSource {
    pub(crate) fn new(samples: Vec<WearableData>) -> Self {
        Self {
            samples,
            pulls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WearableSource for FakeWearableSource {
    async fn pull(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> crate::Result<Vec<WearableData>> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .samples
            .iter()
            .filter(|s| s.user_id == user_id)
            .filter(|s| since.map_or(true, |since| s.timestamp > since))
            .cloned()
            .collect())
    }
}

/// A watch sample with a heart rate and a step count, `minutes_ago` old.
pub(crate) fn watch_sample(user_id: &str, minutes_ago: i64) -> WearableData {
    let at = Utc::now() - ChronoDuration::minutes(minutes_ago);
    let mut metrics = BTreeMap::new();
    metrics.insert("heart_rate".to_string(), 64.0);
    metrics.insert("steps".to_string(), 5400.0);
    WearableData {
        device_id: "watch-1".into(),
        user_id: user_id.into(),
        device_type: DeviceType::Smartwatch,
        timestamp: Utc.timestamp_opt(at.timestamp(), 0).unwrap(),
        metrics,
        device_metadata: DeviceMetadata::default(),
        fhir_codes: BTreeMap::new(),
    }
}

/// Every component wired over one in-memory database and a fake server.
pub(crate) struct Harness {
    pub(crate) config: CareConfig,
    pub(crate) cache: RecordCache,
    pub(crate) sealer: RecordSealer,
    pub(crate) audit: AuditLogger,
    pub(crate) service: Arc<FakeRecordService>,
    pub(crate) uploader: Arc<RecordUploader>,
    pub(crate) connectivity: Arc<StaticConnectivity>,
    manager: Arc<SyncManager>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_config(CareConfig::default())
    }

    pub(crate) fn with_policy(policy: ConflictPolicy) -> Self {
        let mut config = CareConfig::default();
        config.sync.conflict_policy = policy;
        Self::with_config(config)
    }

    pub(crate) fn with_config(config: CareConfig) -> Self {
        let db = memory_db();
        let crypto = EncryptionManager::new(
            Arc::new(MockKeyProvider::new_deterministic()),
            Arc::clone(&db),
            &config.security,
        )
        .unwrap();
        let sealer = RecordSealer::new(Arc::new(crypto), config.security.default_key_alias.clone());
        let cache = RecordCache::new(Arc::clone(&db), &config.cache);
        let audit = AuditLogger::new(Arc::clone(&db));
        let service = Arc::new(FakeRecordService::new());
        let uploader = Arc::new(RecordUploader::new(
            service.clone(),
            cache.clone(),
            sealer.clone(),
            audit.clone(),
        ));
        let manager = Arc::new(SyncManager::new(
            db,
            cache.clone(),
            sealer.clone(),
            Arc::clone(&uploader),
            audit.clone(),
            config.sync.conflict_policy,
        ));

        Self {
            config,
            cache,
            sealer,
            audit,
            service,
            uploader,
            connectivity: Arc::new(StaticConnectivity::new(true)),
            manager,
        }
    }

    pub(crate) fn sync_manager(&self) -> Arc<SyncManager> {
        Arc::clone(&self.manager)
    }

    pub(crate) fn repository(&self) -> Repository {
        Repository::new(
            self.sync_manager(),
            self.connectivity.clone(),
            RecordValidator::new(&self.config.validation),
        )
    }
}
