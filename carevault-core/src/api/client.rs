//! HTTP client for the FHIR health-record API.

use crate::api::{ApiError, AuthService, HealthRecordService, RemoteRecord};
use crate::config::ApiConfig;
use crate::records::HealthRecord;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

/// [`HealthRecordService`] over HTTPS with bearer authentication.
pub struct HttpRecordService {
    client: reqwest::Client,
    base_url: String,
    api_version: u32,
    auth: Arc<dyn AuthService>,
}

impl HttpRecordService {
    pub fn new(config: &ApiConfig, auth: Arc<dyn AuthService>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version,
            auth,
        })
    }

    /// Absolute URL of a path under the health-record API root.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/api/v{}/health-records/fhir/r4{}",
            self.base_url, self.api_version, path
        )
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let token = self.auth.access_token().await?;

        let resp = request
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
            return Err(ApiError::from_status(status.as_u16(), body));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl HealthRecordService for HttpRecordService {
    async fn upload_record(&self, record: &HealthRecord) -> Result<RemoteRecord, ApiError> {
        debug!(record_id = %record.id, version = record.metadata.version, "POST record");
        let request = self.client.post(self.endpoint("/records")).json(record);
        self.send(request).await
    }

    async fn fetch_updated_since(
        &self,
        patient_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRecord>, ApiError> {
        let mut request = self
            .client
            .get(self.endpoint(&format!("/patients/{}/records", patient_id)));
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339_opts(SecondsFormat::Secs, true))]);
        }
        self.send(request).await
    }

    async fn fetch_page(
        &self,
        patient_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<RemoteRecord>, ApiError> {
        let request = self
            .client
            .get(self.endpoint(&format!("/patients/{}/records", patient_id)))
            .query(&[("page", page), ("page_size", page_size)]);
        self.send(request).await
    }
}
