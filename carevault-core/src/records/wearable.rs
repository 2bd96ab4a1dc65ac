//! Wearable device samples and their LOINC-coded metrics.

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Smartwatch,
    FitnessTracker,
    MedicalDevice,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub manufacturer: String,
    pub model: String,
    pub firmware: String,
}

/// One sample pulled from a wearable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WearableData {
    pub device_id: String,
    pub user_id: String,
    pub device_type: DeviceType,
    pub timestamp: DateTime<Utc>,
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub device_metadata: DeviceMetadata,
    /// Per-sample overrides of the metric → LOINC mapping
    #[serde(default)]
    pub fhir_codes: BTreeMap<String, String>,
}

/// A single coded observation derived from a sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetric {
    pub name: String,
    pub value: f64,
    pub unit: Option<String>,
    /// LOINC code, `None` when the metric has no known mapping
    pub code: Option<String>,
    pub device_id: String,
    pub user_id: String,
    pub recorded_at: DateTime<Utc>,
}

/// Standard LOINC code and UCUM unit for a metric name.
pub fn loinc_for(metric: &str) -> Option<(&'static str, &'static str)> {
    let mapping = match metric {
        "heart_rate" => ("8867-4", "/min"),
        "resting_heart_rate" => ("40443-4", "/min"),
        "heart_rate_variability" => ("80404-7", "ms"),
        "steps" => ("41950-7", "/d"),
        "blood_oxygen" | "oxygen_saturation" => ("59408-5", "%"),
        "respiratory_rate" => ("9279-1", "/min"),
        "body_temperature" => ("8310-5", "Cel"),
        "systolic_bp" => ("8480-6", "mm[Hg]"),
        "diastolic_bp" => ("8462-4", "mm[Hg]"),
        "body_weight" => ("29463-7", "kg"),
        "blood_glucose" => ("2339-0", "mg/dL"),
        "sleep_duration" => ("93832-4", "h"),
        _ => return None,
    };
    Some(mapping)
}

impl WearableData {
    /// Flatten the sample into one metric per measured value.
    pub fn to_metrics(&self) -> Vec<HealthMetric> {
        self.metrics
            .iter()
            .map(|(name, value)| {
                let standard = loinc_for(name);
                let code = self
                    .fhir_codes
                    .get(name)
                    .cloned()
                    .or_else(|| standard.map(|(code, _)| code.to_string()));
                HealthMetric {
                    name: name.clone(),
                    value: *value,
                    unit: standard.map(|(_, unit)| unit.to_string()),
                    code,
                    device_id: self.device_id.clone(),
                    user_id: self.user_id.clone(),
                    recorded_at: self.timestamp,
                }
            })
            .collect()
    }
}

/// Pulls samples from a wearable platform (HealthKit, Google Fit, a device SDK).
#[async_trait]
pub trait WearableSource: Send + Sync {
    async fn pull(&self, user_id: &str, since: Option<DateTime<Utc>>) -> Result<Vec<WearableData>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WearableData {
        let mut metrics = BTreeMap::new();
        metrics.insert("heart_rate".to_string(), 72.0);
        metrics.insert("stress_level".to_string(), 3.0);
        WearableData {
            device_id: "watch-1".into(),
            user_id: "patient-1".into(),
            device_type: DeviceType::Smartwatch,
            timestamp: Utc::now(),
            metrics,
            device_metadata: DeviceMetadata::default(),
            fhir_codes: BTreeMap::new(),
        }
    }

    #[test]
    fn known_metrics_get_loinc_codes() {
        let metrics = sample().to_metrics();
        let heart = metrics.iter().find(|m| m.name == "heart_rate").unwrap();
        assert_eq!(heart.code.as_deref(), Some("8867-4"));
        assert_eq!(heart.unit.as_deref(), Some("/min"));
    }

    #[test]
    fn unknown_metrics_are_kept_uncoded() {
        let metrics = sample().to_metrics();
        assert_eq!(metrics.len(), 2);
        let stress = metrics.iter().find(|m| m.name == "stress_level").unwrap();
        assert!(stress.code.is_none());
        assert_eq!(stress.value, 3.0);
    }

    #[test]
    fn sample_codes_override_standard_mapping() {
        let mut data = sample();
        data.fhir_codes
            .insert("stress_level".to_string(), "99999-9".to_string());
        let metrics = data.to_metrics();
        let stress = metrics.iter().find(|m| m.name == "stress_level").unwrap();
        assert_eq!(stress.code.as_deref(), Some("99999-9"));
    }

    #[test]
    fn device_type_serializes_snake_case() {
        let json = serde_json::to_string(&DeviceType::FitnessTracker).unwrap();
        assert_eq!(json, "\"fitness_tracker\"");
    }
}
