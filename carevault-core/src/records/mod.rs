//! Health record domain model.
//!
//! Enumerations serialize as snake_case strings and parse with `FromStr`;
//! an unknown value is a validation error, never a silent default.

pub mod validation;
pub mod wearable;

pub use validation::{RecordValidator, ValidationError};
pub use wearable::{DeviceMetadata, DeviceType, HealthMetric, WearableData, WearableSource};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum.
macro_rules! text_enum {
    ($name:ident, $field:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ValidationError::InvalidEnum {
                        field: $field,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

pub(crate) use text_enum;

/// Kind of clinical document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Consultation,
    LabResult,
    Prescription,
    Imaging,
    VitalSigns,
    Immunization,
    Allergy,
    Procedure,
    DischargeSummary,
    ClinicalNote,
}

text_enum!(RecordType, "record_type", {
    Consultation => "consultation",
    LabResult => "lab_result",
    Prescription => "prescription",
    Imaging => "imaging",
    VitalSigns => "vital_signs",
    Immunization => "immunization",
    Allergy => "allergy",
    Procedure => "procedure",
    DischargeSummary => "discharge_summary",
    ClinicalNote => "clinical_note",
});

/// Lifecycle status, following the FHIR composition status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Draft,
    Preliminary,
    Final,
    Amended,
    Deleted,
    EnteredInError,
}

text_enum!(RecordStatus, "status", {
    Draft => "draft",
    Preliminary => "preliminary",
    Final => "final",
    Amended => "amended",
    Deleted => "deleted",
    EnteredInError => "entered_in_error",
});

impl RecordStatus {
    /// Content of a record in this status may only be superseded, never rewritten.
    pub fn is_immutable(&self) -> bool {
        matches!(self, Self::Final | Self::Deleted)
    }
}

/// FHIR confidentiality label (N / R / V)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidentiality {
    #[default]
    Normal,
    Restricted,
    VeryRestricted,
}

text_enum!(Confidentiality, "confidentiality", {
    Normal => "normal",
    Restricted => "restricted",
    VeryRestricted => "very_restricted",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    Standard,
    Extended,
    Permanent,
}

text_enum!(RetentionPolicy, "retention_policy", {
    Standard => "standard",
    Extended => "extended",
    Permanent => "permanent",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessAction {
    Created,
    Viewed,
    Updated,
    Uploaded,
}

/// One entry of a record's access history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub actor: String,
    pub action: AccessAction,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Content version, starting at 1
    pub version: u32,
    #[serde(default)]
    pub access_history: Vec<AccessEvent>,
    /// Whether content is encrypted at rest
    pub encrypted: bool,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub retain_until: Option<DateTime<Utc>>,
}

impl Default for RecordMetadata {
    fn default() -> Self {
        Self {
            version: 1,
            access_history: Vec::new(),
            encrypted: true,
            retention: RetentionPolicy::Standard,
            retain_until: None,
        }
    }
}

/// Reference to a document attached to a record. The binary lives elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub content_type: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
}

/// Opaque clinical content, encrypted at rest
pub type RecordContent = serde_json::Map<String, serde_json::Value>;

/// A decrypted health record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub id: String,
    pub patient_id: String,
    pub provider_id: String,
    pub record_type: RecordType,
    pub date: DateTime<Utc>,
    pub content: RecordContent,
    #[serde(default)]
    pub metadata: RecordMetadata,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub status: RecordStatus,
    #[serde(default)]
    pub confidentiality: Confidentiality,
}

impl HealthRecord {
    /// Create a draft record with a fresh id, dated now.
    pub fn new(
        patient_id: impl Into<String>,
        provider_id: impl Into<String>,
        record_type: RecordType,
        content: RecordContent,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            patient_id: patient_id.into(),
            provider_id: provider_id.into(),
            record_type,
            date: Utc::now(),
            content,
            metadata: RecordMetadata::default(),
            attachments: Vec::new(),
            status: RecordStatus::Draft,
            confidentiality: Confidentiality::Normal,
        }
    }

    /// Append an access event to the record's history
    pub fn record_access(&mut self, actor: &str, action: AccessAction) {
        self.metadata.access_history.push(AccessEvent {
            actor: actor.to_string(),
            action,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_type_parses_known_values() {
        assert_eq!("lab_result".parse::<RecordType>().unwrap(), RecordType::LabResult);
        assert_eq!(RecordType::VitalSigns.as_str(), "vital_signs");
    }

    #[test]
    fn unknown_enum_value_is_validation_error() {
        let err = "x_ray".parse::<RecordType>().unwrap_err();
        assert_eq!(
            err,
            ValidationError::InvalidEnum {
                field: "record_type",
                value: "x_ray".to_string()
            }
        );
        assert!("closed".parse::<RecordStatus>().is_err());
    }

    #[test]
    fn serde_names_match_text_names() {
        let json = serde_json::to_string(&RecordStatus::EnteredInError).unwrap();
        assert_eq!(json, "\"entered_in_error\"");
        assert_eq!(RecordStatus::EnteredInError.as_str(), "entered_in_error");

        let json = serde_json::to_string(&Confidentiality::VeryRestricted).unwrap();
        assert_eq!(json, format!("\"{}\"", Confidentiality::VeryRestricted));
    }

    #[test]
    fn only_final_and_deleted_are_immutable() {
        assert!(RecordStatus::Final.is_immutable());
        assert!(RecordStatus::Deleted.is_immutable());
        assert!(!RecordStatus::Draft.is_immutable());
        assert!(!RecordStatus::Amended.is_immutable());
    }

    #[test]
    fn new_record_is_draft_version_one() {
        let record = HealthRecord::new("p1", "dr1", RecordType::Consultation, RecordContent::new());
        assert_eq!(record.status, RecordStatus::Draft);
        assert_eq!(record.metadata.version, 1);
        assert!(record.metadata.encrypted);
        assert!(Uuid::parse_str(&record.id).is_ok());
    }

    #[test]
    fn record_access_appends_history() {
        let mut record =
            HealthRecord::new("p1", "dr1", RecordType::Imaging, RecordContent::new());
        record.record_access("dr1", AccessAction::Viewed);
        assert_eq!(record.metadata.access_history.len(), 1);
        assert_eq!(record.metadata.access_history[0].action, AccessAction::Viewed);
    }
}
