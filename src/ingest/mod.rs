//! Reading intake: validation, min-max scaling and per-device windows.

pub mod scaler;
pub mod window;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub use scaler::MinMaxScaler;
pub use window::{WindowManager, WindowSnapshot, WindowState};

/// One sensor reading as received from a device. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    #[serde(default = "Utc::now", with = "timestamp_serde")]
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub vibration: f64,
    #[serde(default)]
    pub power_usage: f64,
}

impl Reading {
    pub fn new(device_id: impl Into<String>, temperature: f64, vibration: f64, power_usage: f64) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: Utc::now(),
            temperature,
            vibration,
            power_usage,
        }
    }

    /// Reject readings that must never reach a window.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.device_id.trim().is_empty() {
            return Err(ValidationError::EmptyDeviceId);
        }
        for (field, value) in [
            ("temperature", self.temperature),
            ("vibration", self.vibration),
            ("power_usage", self.power_usage),
        ] {
            if !value.is_finite() {
                return Err(ValidationError::NonFinite { field, value });
            }
        }
        Ok(())
    }

    /// Raw feature vector in the order the scaler was fitted with.
    pub fn features(&self, set: FeatureSet) -> Vec<f64> {
        match set {
            FeatureSet::TemperatureVibration => vec![self.temperature, self.vibration],
            FeatureSet::TemperatureVibrationPower => {
                vec![self.temperature, self.vibration, self.power_usage]
            }
        }
    }
}

/// Which numeric reading fields feed the scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSet {
    TemperatureVibration,
    TemperatureVibrationPower,
}

impl FeatureSet {
    /// Feature count `F`.
    pub fn count(self) -> usize {
        self.names().len()
    }

    pub fn names(self) -> &'static [&'static str] {
        match self {
            FeatureSet::TemperatureVibration => &["temperature", "vibration"],
            FeatureSet::TemperatureVibrationPower => &["temperature", "vibration", "power_usage"],
        }
    }
}

/// A scaled feature vector of fixed dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedSample(Vec<f64>);

impl NormalizedSample {
    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<f64>> for NormalizedSample {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

/// Timestamps arrive either as RFC 3339 or as a naive ISO 8601 string
/// (interpreted as UTC).
mod timestamp_serde {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_non_finite() {
        let mut r = Reading::new("D1", 25.0, 0.5, 30.0);
        assert!(r.validate().is_ok());

        r.vibration = f64::NAN;
        assert!(matches!(
            r.validate(),
            Err(ValidationError::NonFinite { field: "vibration", .. })
        ));

        r.vibration = 0.5;
        r.power_usage = f64::INFINITY;
        assert!(matches!(
            r.validate(),
            Err(ValidationError::NonFinite { field: "power_usage", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_blank_device() {
        let r = Reading::new("   ", 25.0, 0.5, 30.0);
        assert_eq!(r.validate(), Err(ValidationError::EmptyDeviceId));
    }

    #[test]
    fn test_feature_sets() {
        let r = Reading::new("D1", 25.0, 0.5, 30.0);
        assert_eq!(r.features(FeatureSet::TemperatureVibration), vec![25.0, 0.5]);
        assert_eq!(
            r.features(FeatureSet::TemperatureVibrationPower),
            vec![25.0, 0.5, 30.0]
        );
        assert_eq!(FeatureSet::TemperatureVibration.count(), 2);
        assert_eq!(FeatureSet::TemperatureVibrationPower.count(), 3);
    }

    #[test]
    fn test_reading_accepts_naive_timestamp() {
        let json = r#"{
            "device_id": "Device-001",
            "temperature": 42.5,
            "vibration": 1.2,
            "power_usage": 30.0,
            "timestamp": "2025-03-01T12:30:45.123456"
        }"#;
        let r: Reading = serde_json::from_str(json).unwrap();
        assert_eq!(r.timestamp.to_rfc3339(), "2025-03-01T12:30:45.123456+00:00");
    }

    #[test]
    fn test_reading_defaults_missing_fields() {
        let json = r#"{"device_id": "D9", "temperature": 20.0, "vibration": 0.3}"#;
        let r: Reading = serde_json::from_str(json).unwrap();
        assert_eq!(r.power_usage, 0.0);
        assert!(r.validate().is_ok());
    }
}
