//! Row models for the encrypted record cache.

use crate::crypto::EncryptedData;
use crate::records::{
    Attachment, Confidentiality, HealthRecord, RecordContent, RecordMetadata, RecordStatus,
    RecordType,
};
use chrono::{DateTime, Utc};

/// One version of a health record as stored in the cache.
///
/// Identifying and indexing columns are clear; clinical content is only
/// present as ciphertext.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRecord {
    pub record_id: String,
    pub version: u32,
    pub patient_id: String,
    pub provider_id: String,
    pub record_type: RecordType,
    pub status: RecordStatus,
    pub confidentiality: Confidentiality,
    pub record_date: DateTime<Utc>,
    pub content: EncryptedData,
    pub metadata: RecordMetadata,
    pub attachments: Vec<Attachment>,
    pub last_modified: DateTime<Utc>,
    /// Modified locally and not yet acknowledged by the server
    pub pending: bool,
    /// Server-assigned version, 0 when never synced
    pub server_version: i64,
}

impl CachedRecord {
    /// Build a cache row from a record whose content is already encrypted.
    pub fn from_record(record: &HealthRecord, content: EncryptedData, pending: bool) -> Self {
        Self {
            record_id: record.id.clone(),
            version: record.metadata.version,
            patient_id: record.patient_id.clone(),
            provider_id: record.provider_id.clone(),
            record_type: record.record_type,
            status: record.status,
            confidentiality: record.confidentiality,
            record_date: record.date,
            last_modified: content.timestamp,
            content,
            metadata: record.metadata.clone(),
            attachments: record.attachments.clone(),
            pending,
            server_version: 0,
        }
    }

    /// Reassemble the record with its decrypted content.
    pub fn into_record(self, content: RecordContent) -> HealthRecord {
        HealthRecord {
            id: self.record_id,
            patient_id: self.patient_id,
            provider_id: self.provider_id,
            record_type: self.record_type,
            date: self.record_date,
            content,
            metadata: self.metadata,
            attachments: self.attachments,
            status: self.status,
            confidentiality: self.confidentiality,
        }
    }
}

/// Result of [`RecordCache::update`](super::RecordCache::update)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The latest row was rewritten
    InPlace,
    /// The latest row was immutable; a new version row was inserted
    NewVersion(u32),
}

/// Filter for cache reads. Only the latest version of each record is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordQuery {
    pub patient_id: String,
    pub record_type: Option<RecordType>,
    pub status: Option<RecordStatus>,
}

impl RecordQuery {
    pub fn for_patient(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            record_type: None,
            status: None,
        }
    }
}

/// Paginated result with metadata
#[derive(Debug, Clone, PartialEq)]
pub struct RecordPage<T> {
    /// Items in this page
    pub items: Vec<T>,
    /// Total count of matching rows
    pub total_count: usize,
    /// Current page offset
    pub offset: usize,
    /// Page size limit
    pub limit: usize,
    /// Whether there are more pages
    pub has_more: bool,
}

impl<T> RecordPage<T> {
    pub fn new(items: Vec<T>, total_count: usize, offset: usize, limit: usize) -> Self {
        let has_more = offset + items.len() < total_count;
        Self {
            items,
            total_count,
            offset,
            limit,
            has_more,
        }
    }

    /// Zero-based page number of this page
    pub fn page(&self) -> usize {
        if self.limit == 0 {
            0
        } else {
            self.offset / self.limit
        }
    }

    pub fn next_page(&self) -> Option<usize> {
        self.has_more.then(|| self.page() + 1)
    }

    pub fn prev_page(&self) -> Option<usize> {
        (self.offset > 0).then(|| self.page().saturating_sub(1))
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Convert the items, keeping pagination metadata.
    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<RecordPage<U>, E> {
        let items = self.items.into_iter().map(f).collect::<Result<Vec<_>, E>>()?;
        Ok(RecordPage {
            items,
            total_count: self.total_count,
            offset: self.offset,
            limit: self.limit,
            has_more: self.has_more,
        })
    }
}

/// Freshness of a patient's cached records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheState {
    pub last_refresh: Option<DateTime<Utc>>,
    /// Never refreshed, or refreshed longer ago than the TTL
    pub expired: bool,
}

/// One encrypted wearable metric row
#[derive(Debug, Clone, PartialEq)]
pub struct CachedWearable {
    pub sample_id: String,
    pub user_id: String,
    pub device_id: String,
    pub metric_code: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub content: EncryptedData,
    pub pending: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_navigation() {
        let page = RecordPage::new(vec![1, 2, 3], 10, 3, 3);
        assert!(page.has_more);
        assert_eq!(page.page(), 1);
        assert_eq!(page.next_page(), Some(2));
        assert_eq!(page.prev_page(), Some(0));

        let last = RecordPage::new(vec![10], 10, 9, 3);
        assert!(!last.has_more);
        assert_eq!(last.next_page(), None);

        let first = RecordPage::<i32>::new(vec![], 0, 0, 20);
        assert_eq!(first.prev_page(), None);
        assert!(first.is_empty());
    }

    #[test]
    fn try_map_keeps_metadata() {
        let page = RecordPage::new(vec![1, 2], 5, 0, 2);
        let mapped: RecordPage<String> = page
            .try_map(|n| Ok::<_, ()>(n.to_string()))
            .unwrap();
        assert_eq!(mapped.items, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(mapped.total_count, 5);
        assert!(mapped.has_more);
    }
}
