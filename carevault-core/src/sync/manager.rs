//! Sync manager: runs the upload, fetch, merge cycle for an entity.

use crate::api::RemoteRecord;
use crate::audit::{AuditEventType, AuditLogger};
use crate::crypto::{CryptoError, RecordSealer};
use crate::database::{Database, RecordCache};
use crate::sync::conflict::{ConflictPolicy, ConflictResolver, LocalVersion, Resolution};
use crate::sync::models::{SyncConflict, SyncPhase, SyncReport};
use crate::sync::state;
use crate::sync::uploader::RecordUploader;
use crate::{CareError, DatabaseError, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Counts produced by merging server copies into the cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub merged: usize,
    pub conflicts: usize,
    pub rejected: usize,
}

/// Orchestrates sync cycles. At most one cycle runs at a time.
pub struct SyncManager {
    db: Arc<Mutex<Database>>,
    cache: RecordCache,
    sealer: RecordSealer,
    uploader: Arc<RecordUploader>,
    audit: AuditLogger,
    policy: ConflictPolicy,
    in_flight: AtomicBool,
    phase: watch::Sender<SyncPhase>,
}

/// Releases the in-flight flag when a cycle ends, however it ends.
///
/// A finished cycle leaves `Success` or `Error` published until the next one
/// starts. A cycle dropped mid-way falls back to `Idle`.
struct CycleGuard<'a> {
    manager: &'a SyncManager,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.manager.phase.send_if_modified(|phase| {
            let abandoned = *phase == SyncPhase::Syncing;
            if abandoned {
                *phase = SyncPhase::Idle;
            }
            abandoned
        });
        self.manager.in_flight.store(false, Ordering::SeqCst);
    }
}

impl SyncManager {
    pub fn new(
        db: Arc<Mutex<Database>>,
        cache: RecordCache,
        sealer: RecordSealer,
        uploader: Arc<RecordUploader>,
        audit: AuditLogger,
        policy: ConflictPolicy,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            db,
            cache,
            sealer,
            uploader,
            audit,
            policy,
            in_flight: AtomicBool::new(false),
            phase,
        }
    }

    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }

    pub fn sealer(&self) -> &RecordSealer {
        &self.sealer
    }

    pub fn uploader(&self) -> &Arc<RecordUploader> {
        &self.uploader
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Observe phase changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    fn lock(&self, context: &str) -> Result<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned(context.to_string()).into())
    }

    pub fn get_last_sync_time(&self, entity_id: &str) -> Result<Option<DateTime<Utc>>> {
        let db = self.lock("last sync time")?;
        state::last_sync_time(db.conn(), entity_id)
    }

    /// Set the last sync time of an entity to now.
    pub fn update_last_sync_time(&self, entity_id: &str) -> Result<()> {
        self.store_last_sync_time(entity_id, Utc::now())
    }

    fn store_last_sync_time(&self, entity_id: &str, at: DateTime<Utc>) -> Result<()> {
        let db = self.lock("update sync time")?;
        state::set_last_sync_time(db.conn(), entity_id, at)
    }

    pub fn last_sync_times(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
        let db = self.lock("sync times")?;
        state::all_sync_times(db.conn())
    }

    /// Queue the latest version of a record for the next cycle.
    pub fn mark_for_sync(&self, record_id: &str) -> Result<()> {
        if !self.cache.mark_pending(record_id)? {
            return Err(CareError::NotFound(format!("record {}", record_id)));
        }
        debug!(record_id, "Marked record for sync");
        Ok(())
    }

    fn begin(&self) -> Result<CycleGuard<'_>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CareError::AlreadySyncing);
        }
        self.phase.send_replace(SyncPhase::Syncing);
        Ok(CycleGuard { manager: self })
    }

    /// Run one cycle for an entity.
    pub async fn sync(&self, entity_id: &str) -> Result<SyncReport> {
        let mut reports = self.sync_entities(&[entity_id.to_string()]).await?;
        reports
            .pop()
            .ok_or_else(|| CareError::NotFound(format!("sync report for {}", entity_id)))
    }

    /// Run one cycle per entity under a single in-flight guard.
    ///
    /// Every entity is attempted; the first error is returned afterwards.
    /// A fatal error stops the remaining entities.
    pub async fn sync_entities(&self, entities: &[String]) -> Result<Vec<SyncReport>> {
        let _guard = self.begin()?;

        let mut reports = Vec::with_capacity(entities.len());
        let mut first_error = None;
        for entity_id in entities {
            match self.run_cycle(entity_id).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!(entity_id = %entity_id, error = %e, "Sync cycle failed");
                    if let Err(audit_err) = self.audit.log(
                        AuditEventType::SyncFailed {
                            entity_id: entity_id.clone(),
                            reason: e.to_string(),
                        },
                        "sync",
                    ) {
                        warn!(error = %audit_err, "Failed to audit sync failure");
                    }
                    let fatal = e.is_fatal();
                    first_error.get_or_insert(e);
                    if fatal {
                        break;
                    }
                }
            }
        }

        match first_error {
            Some(e) => {
                self.phase.send_replace(SyncPhase::Error);
                Err(e)
            }
            None => {
                self.phase.send_replace(SyncPhase::Success);
                Ok(reports)
            }
        }
    }

    async fn run_cycle(&self, entity_id: &str) -> Result<SyncReport> {
        let started = Utc::now();
        let mut report = SyncReport {
            entity_id: entity_id.to_string(),
            ..SyncReport::default()
        };

        for row in self.cache.get_pending(entity_id)? {
            match self.uploader.upload_cached(&row).await {
                Ok(_) => report.uploaded += 1,
                Err(e) if e.is_fatal() || matches!(e, CareError::Unauthorized(_)) => {
                    return Err(e)
                }
                Err(e) => {
                    warn!(record_id = %row.record_id, error = %e, "Upload failed, record stays pending");
                    report.upload_failures += 1;
                }
            }
        }

        let since = self.get_last_sync_time(entity_id)?;
        let remote = self
            .uploader
            .service()
            .fetch_updated_since(entity_id, since)
            .await?;
        report.pulled = remote.len();

        let outcome = self.merge_remote(&remote)?;
        report.merged = outcome.merged;
        report.conflicts = outcome.conflicts;
        report.rejected = outcome.rejected;

        self.store_last_sync_time(entity_id, started)?;
        report.finished_at = Some(Utc::now());

        self.audit.log(
            AuditEventType::SyncCompleted {
                entity_id: entity_id.to_string(),
                uploaded: report.uploaded,
                merged: report.merged,
                conflicts: report.conflicts,
            },
            "sync",
        )?;
        info!(
            entity_id,
            uploaded = report.uploaded,
            upload_failures = report.upload_failures,
            pulled = report.pulled,
            merged = report.merged,
            conflicts = report.conflicts,
            "Sync cycle complete"
        );
        Ok(report)
    }

    /// Merge server copies into the cache under the configured policy.
    pub fn merge_remote(&self, records: &[RemoteRecord]) -> Result<MergeOutcome> {
        let mut outcome = MergeOutcome::default();

        for remote in records {
            let record_id = &remote.record.id;
            let Some(local) = self.cache.get_by_id(record_id)? else {
                if ConflictResolver::accept_new(remote) {
                    self.apply_remote(remote)?;
                    outcome.merged += 1;
                } else {
                    outcome.rejected += 1;
                }
                continue;
            };

            match ConflictResolver::resolve(self.policy, LocalVersion::from(&local), remote) {
                Resolution::AcceptRemote => {
                    self.apply_remote(remote)?;
                    outcome.merged += 1;
                }
                Resolution::KeepLocal => {}
                Resolution::Conflict => {
                    let payload = self.sealer.seal_conflict(remote)?;
                    let db = self.lock("record conflict")?;
                    let (conflict_id, created) = state::insert_conflict(
                        db.conn(),
                        record_id,
                        local.version,
                        remote.server_version,
                        &payload,
                    )?;
                    if created {
                        info!(record_id = %record_id, conflict_id, "Conflict recorded");
                    }
                    outcome.conflicts += 1;
                }
                Resolution::RejectRollback => {
                    warn!(
                        record_id = %record_id,
                        local = local.server_version,
                        remote = remote.server_version,
                        "Rejected server rollback"
                    );
                    outcome.rejected += 1;
                }
            }
        }

        Ok(outcome)
    }

    fn apply_remote(&self, remote: &RemoteRecord) -> Result<()> {
        let row = self.sealer.seal_remote(remote)?;
        self.cache.upsert_from_server(&row, true)
    }

    /// Unresolved conflicts, oldest first.
    pub fn list_conflicts(&self) -> Result<Vec<SyncConflict>> {
        let db = self.lock("list conflicts")?;
        state::list_conflicts(db.conn(), false)
    }

    /// Finish a manual conflict.
    ///
    /// `keep_local` keeps the cached edit pending on top of the server
    /// version; otherwise the stored server copy replaces it.
    pub fn resolve_conflict(&self, conflict_id: i64, keep_local: bool) -> Result<()> {
        let loaded = {
            let db = self.lock("load conflict")?;
            state::load_conflict(db.conn(), conflict_id)?
        };
        let Some((conflict, payload)) = loaded else {
            return Err(CareError::NotFound(format!("conflict {}", conflict_id)));
        };

        if keep_local {
            self.cache
                .acknowledge_server_version(&conflict.record_id, conflict.server_version)?;
            self.mark_for_sync(&conflict.record_id)?;
        } else {
            let remote =
                self.sealer
                    .open_conflict(&conflict.record_id, conflict.server_version, &payload)?;
            self.apply_remote(&remote)?;
        }

        let db = self.lock("resolve conflict")?;
        state::mark_conflict_resolved(db.conn(), conflict_id)?;
        info!(conflict_id, record_id = %conflict.record_id, keep_local, "Conflict resolved");
        Ok(())
    }

    /// Move stored conflict payloads under `current_key_version`.
    ///
    /// Payloads under purged keys cannot be read and are skipped.
    pub fn reencrypt_conflicts(&self, current_key_version: u32) -> Result<usize> {
        let stale = {
            let db = self.lock("stale conflicts")?;
            state::stale_conflict_payloads(db.conn(), current_key_version)?
        };

        let mut migrated = 0;
        for (conflict_id, record_id, server_version, payload) in stale {
            let resealed = match self
                .sealer
                .reseal_conflict(&record_id, server_version, &payload)
            {
                Ok(resealed) => resealed,
                Err(CareError::Security(CryptoError::KeyExpired(version))) => {
                    warn!(conflict_id, key_version = version, "Conflict payload key purged");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let db = self.lock("replace conflict payload")?;
            state::replace_conflict_payload(db.conn(), conflict_id, &resealed)?;
            migrated += 1;
        }
        Ok(migrated)
    }

    /// Spawn the sync worker. Each tick runs a cycle for `entities`, or for
    /// every cached patient when `entities` is empty.
    pub fn schedule_periodic_sync(
        self: &Arc<Self>,
        interval: Duration,
        entities: Vec<String>,
    ) -> SyncSchedule {
        let (cancel, mut cancelled) = watch::channel(false);
        let manager = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = cancelled.changed() => {
                        if changed.is_err() || *cancelled.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if *cancelled.borrow() {
                    break;
                }
                manager.run_scheduled(&entities).await;
            }
            debug!("Periodic sync stopped");
        });

        info!(interval_secs = interval.as_secs(), "Periodic sync scheduled");
        SyncSchedule { cancel, handle }
    }

    async fn run_scheduled(&self, entities: &[String]) {
        let entities = if entities.is_empty() {
            match self.cache.patients() {
                Ok(patients) => patients,
                Err(e) => {
                    warn!(error = %e, "Could not list cached patients");
                    return;
                }
            }
        } else {
            entities.to_vec()
        };

        match self.sync_entities(&entities).await {
            Ok(reports) => debug!(entities = reports.len(), "Scheduled sync finished"),
            Err(CareError::AlreadySyncing) => debug!("Skipping tick, sync already in flight"),
            Err(e) => warn!(error = %e, "Scheduled sync failed"),
        }
    }
}

/// Handle to the periodic sync worker. Dropping it stops the worker.
pub struct SyncSchedule {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncSchedule {
    /// Stop future ticks. A cycle already running completes.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Wait for the worker to exit.
    pub async fn join(self) {
        let SyncSchedule { cancel, handle } = self;
        if let Err(e) = handle.await {
            warn!(error = %e, "Sync worker ended abnormally");
        }
        drop(cancel);
    }
}
