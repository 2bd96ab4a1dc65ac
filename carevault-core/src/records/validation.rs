//! Validation gate applied before a record reaches the cache or the network.

use crate::config::ValidationConfig;
use crate::records::{HealthRecord, RecordStatus};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Reasons a record is refused. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid {field}: {value}")]
    InvalidEnum { field: &'static str, value: String },

    #[error("Record content is empty")]
    EmptyContent,

    #[error("Record date {0} is in the future")]
    FutureDate(DateTime<Utc>),

    #[error("Too many attachments: {count} (max {max})")]
    TooManyAttachments { count: usize, max: usize },

    #[error("Content too large: {size} bytes (max {max})")]
    ContentTooLarge { size: usize, max: usize },

    #[error("Metadata version must be at least 1")]
    InvalidVersion,

    #[error("A new record cannot be created as entered_in_error")]
    EnteredInErrorAsNew,

    #[error("Rejected by server: {0}")]
    Remote(String),
}

/// Checks records against the configured limits
#[derive(Debug, Clone)]
pub struct RecordValidator {
    max_attachments: usize,
    max_content_bytes: usize,
}

impl RecordValidator {
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            max_attachments: config.max_attachments,
            max_content_bytes: config.max_content_bytes,
        }
    }

    /// Validate a record for upload, failing on the first violation.
    pub fn validate(&self, record: &HealthRecord) -> Result<(), ValidationError> {
        self.validate_at(record, Utc::now())
    }

    pub fn validate_at(&self, record: &HealthRecord, now: DateTime<Utc>) -> Result<(), ValidationError> {
        require("id", &record.id)?;
        require("patient_id", &record.patient_id)?;
        require("provider_id", &record.provider_id)?;

        if record.content.is_empty() {
            return Err(ValidationError::EmptyContent);
        }

        if record.date > now {
            return Err(ValidationError::FutureDate(record.date));
        }

        if record.attachments.len() > self.max_attachments {
            return Err(ValidationError::TooManyAttachments {
                count: record.attachments.len(),
                max: self.max_attachments,
            });
        }

        let size = serde_json::to_vec(&record.content)
            .map(|bytes| bytes.len())
            .unwrap_or(usize::MAX);
        if size > self.max_content_bytes {
            return Err(ValidationError::ContentTooLarge {
                size,
                max: self.max_content_bytes,
            });
        }

        if record.metadata.version == 0 {
            return Err(ValidationError::InvalidVersion);
        }

        // Version 1 has never been stored anywhere
        if record.status == RecordStatus::EnteredInError && record.metadata.version == 1 {
            return Err(ValidationError::EnteredInErrorAsNew);
        }

        Ok(())
    }
}

impl Default for RecordValidator {
    fn default() -> Self {
        Self::new(&ValidationConfig::default())
    }
}

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(())
}
