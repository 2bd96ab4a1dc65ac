//! Record synchronization
//!
//! - Sequential uploads of pending records through one shared uploader
//! - Incremental pulls keyed by the last sync time of each patient
//! - Configurable conflict policy with rollback rejection
//! - Periodic scheduling on a single worker task

pub mod conflict;
pub mod manager;
pub mod models;
pub mod state;
pub mod uploader;

pub use conflict::{ConflictPolicy, ConflictResolver, Resolution};
pub use manager::{MergeOutcome, SyncManager, SyncSchedule};
pub use models::{SyncConflict, SyncPhase, SyncReport};
pub use uploader::RecordUploader;
