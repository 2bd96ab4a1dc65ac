//! Remote health-record service boundary.
//!
//! - [`HealthRecordService`]: typed remote API, implemented over HTTP by
//!   [`client::HttpRecordService`]
//! - [`resilience::ResilientService`]: retry and circuit breaking around any service
//! - [`ConnectivityMonitor`] and [`AuthService`]: platform adapters

pub mod client;
pub mod resilience;

pub use client::HttpRecordService;
pub use resilience::{BreakerState, CircuitBreaker, ResilientService, RetryPolicy};

use crate::records::HealthRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Errors returned by the remote service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Rejected as invalid: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Map a non-success HTTP status to an error.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            408 | 429 | 500..=599 => Self::Network(format!("HTTP {}: {}", status, body)),
            400 | 422 => Self::Validation(body),
            409 => Self::Conflict(body),
            401 | 403 => Self::Unauthorized(body),
            _ => Self::Rejected { status, body },
        }
    }

    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// A record as known by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub record: HealthRecord,
    /// Monotonic version assigned by the server
    pub server_version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Remote health-record API
#[async_trait]
pub trait HealthRecordService: Send + Sync {
    /// Create or update a record on the server.
    async fn upload_record(&self, record: &HealthRecord) -> Result<RemoteRecord, ApiError>;

    /// Records of a patient changed after `since`, or all of them when `None`.
    async fn fetch_updated_since(
        &self,
        patient_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRecord>, ApiError>;

    /// One page of a patient's records, newest first.
    async fn fetch_page(
        &self,
        patient_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<RemoteRecord>, ApiError>;
}

/// Supplies bearer tokens for API requests
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn access_token(&self) -> Result<String, ApiError>;
}

/// Auth adapter that always returns the same token
pub struct StaticTokenAuth {
    token: String,
}

impl StaticTokenAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AuthService for StaticTokenAuth {
    async fn access_token(&self) -> Result<String, ApiError> {
        if self.token.is_empty() {
            return Err(ApiError::Unauthorized("no access token configured".to_string()));
        }
        Ok(self.token.clone())
    }
}

/// Reports whether the device currently has network access
pub trait ConnectivityMonitor: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Connectivity flag set by the embedding application
#[derive(Debug)]
pub struct StaticConnectivity {
    online: AtomicBool,
}

impl StaticConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl ConnectivityMonitor for StaticConnectivity {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(matches!(ApiError::from_status(503, String::new()), ApiError::Network(_)));
        assert!(matches!(ApiError::from_status(429, String::new()), ApiError::Network(_)));
        assert!(matches!(ApiError::from_status(408, String::new()), ApiError::Network(_)));
        assert!(matches!(ApiError::from_status(422, String::new()), ApiError::Validation(_)));
        assert!(matches!(ApiError::from_status(409, String::new()), ApiError::Conflict(_)));
        assert!(matches!(ApiError::from_status(401, String::new()), ApiError::Unauthorized(_)));
        assert_eq!(
            ApiError::from_status(404, "gone".into()),
            ApiError::Rejected {
                status: 404,
                body: "gone".into()
            }
        );
    }

    #[test]
    fn only_network_errors_retry() {
        assert!(ApiError::Network("reset".into()).is_retryable());
        assert!(!ApiError::CircuitOpen.is_retryable());
        assert!(!ApiError::Validation("bad".into()).is_retryable());
    }

    #[test]
    fn connectivity_toggles() {
        let monitor = StaticConnectivity::new(false);
        assert!(!monitor.is_online());
        monitor.set_online(true);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn empty_static_token_is_unauthorized() {
        assert!(StaticTokenAuth::new("").access_token().await.is_err());
        assert_eq!(
            StaticTokenAuth::new("abc").access_token().await.unwrap(),
            "abc"
        );
    }
}
