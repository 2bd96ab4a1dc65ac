//! Sync data models: cycle phase, cycle report, and recorded conflicts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase of the sync state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Syncing,
    Success,
    Error,
}

impl SyncPhase {
    /// Convert the phase to its string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Outcome of one sync cycle for one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub entity_id: String,
    /// Pending records accepted by the server
    pub uploaded: usize,
    /// Pending records that stayed pending
    pub upload_failures: usize,
    /// Remote records received
    pub pulled: usize,
    /// Remote records written into the cache
    pub merged: usize,
    /// Conflicts recorded for manual resolution
    pub conflicts: usize,
    /// Remote records older than the local copy
    pub rejected: usize,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A conflict kept for manual resolution.
///
/// The server copy is stored encrypted; `local_version` is the cached
/// version that was pending when the conflict was detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConflict {
    pub conflict_id: i64,
    pub record_id: String,
    pub local_version: u32,
    pub server_version: i64,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_names() {
        assert_eq!(SyncPhase::Syncing.as_str(), "syncing");
        let json = serde_json::to_string(&SyncPhase::Error).unwrap();
        assert_eq!(json, "\"error\"");
    }

    #[test]
    fn empty_report() {
        let report = SyncReport::default();
        assert_eq!(report.uploaded + report.merged + report.conflicts, 0);
        assert!(report.finished_at.is_none());
    }
}
