//! Database layer for the record cache.
//!
//! This module handles schema management and the encrypted record and
//! wearable cache. Content columns only ever hold ciphertext.

pub mod cache;
pub mod models;
pub mod schema;

pub use cache::RecordCache;
pub use models::{CacheState, CachedRecord, CachedWearable, RecordPage, RecordQuery, UpdateOutcome};
pub use schema::Database;
