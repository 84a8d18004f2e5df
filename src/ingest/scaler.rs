//! Min-max feature scaler.
//!
//! Parameters are fitted offline (`depinguard fit-scaler`) and loaded once at
//! startup. Nothing mutates them afterwards; the manager shares one instance
//! across all devices behind an `Arc`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ScalerConfig;
use crate::error::ValidationError;
use crate::ingest::{FeatureSet, NormalizedSample};

fn default_feature_range() -> (f64, f64) {
    (0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    data_min: Vec<f64>,
    data_max: Vec<f64>,
    #[serde(default = "default_feature_range")]
    feature_range: (f64, f64),
}

impl MinMaxScaler {
    pub fn new(data_min: Vec<f64>, data_max: Vec<f64>, feature_range: (f64, f64)) -> Result<Self> {
        anyhow::ensure!(!data_min.is_empty(), "scaler needs at least one feature");
        anyhow::ensure!(
            data_min.len() == data_max.len(),
            "scaler data_min has {} entries but data_max has {}",
            data_min.len(),
            data_max.len()
        );
        for (i, (lo, hi)) in data_min.iter().zip(&data_max).enumerate() {
            anyhow::ensure!(
                lo.is_finite() && hi.is_finite() && lo <= hi,
                "scaler feature {i}: invalid bounds [{lo}, {hi}]"
            );
        }
        anyhow::ensure!(
            feature_range.0 < feature_range.1,
            "feature_range must be increasing, got {:?}",
            feature_range
        );
        Ok(Self {
            data_min,
            data_max,
            feature_range,
        })
    }

    /// Normal operating envelope of the simulated fleet.
    pub fn default_for(set: FeatureSet) -> Self {
        let (data_min, data_max) = match set {
            FeatureSet::TemperatureVibration => (vec![20.0, 0.1], vec![60.0, 2.0]),
            FeatureSet::TemperatureVibrationPower => {
                (vec![20.0, 0.1, 10.0], vec![60.0, 2.0, 50.0])
            }
        };
        Self {
            data_min,
            data_max,
            feature_range: default_feature_range(),
        }
    }

    /// Fit per-feature bounds from known-normal rows.
    pub fn fit(rows: &[Vec<f64>], feature_range: (f64, f64)) -> Result<Self> {
        let first = rows.first().context("cannot fit a scaler on zero rows")?;
        let mut data_min = first.clone();
        let mut data_max = first.clone();
        for (n, row) in rows.iter().enumerate() {
            anyhow::ensure!(
                row.len() == data_min.len(),
                "row {n} has {} features, expected {}",
                row.len(),
                data_min.len()
            );
            for (i, &v) in row.iter().enumerate() {
                anyhow::ensure!(v.is_finite(), "row {n} feature {i} is not finite");
                data_min[i] = data_min[i].min(v);
                data_max[i] = data_max[i].max(v);
            }
        }
        Self::new(data_min, data_max, feature_range)
    }

    /// Load scaler parameters from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scaler file: {}", path.display()))?;
        let raw: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse scaler file: {}", path.display()))?;
        Self::new(raw.data_min, raw.data_max, raw.feature_range)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write scaler file: {}", path.display()))?;
        Ok(())
    }

    /// Build the scaler described by config and check it matches the feature set.
    pub fn from_config(config: &ScalerConfig, set: FeatureSet) -> Result<Self> {
        let scaler = match (&config.path, &config.data_min, &config.data_max) {
            (Some(path), _, _) => Self::load(path)?,
            (None, Some(lo), Some(hi)) => Self::new(lo.clone(), hi.clone(), config.feature_range)?,
            (None, None, None) => Self::default_for(set),
            _ => anyhow::bail!("scaler config must set both data_min and data_max, or neither"),
        };
        anyhow::ensure!(
            scaler.dimension() == set.count(),
            "scaler has {} features but window.features needs {}",
            scaler.dimension(),
            set.count()
        );
        info!(features = ?set.names(), "scaler loaded");
        Ok(scaler)
    }

    pub fn dimension(&self) -> usize {
        self.data_min.len()
    }

    pub fn data_min(&self) -> &[f64] {
        &self.data_min
    }

    pub fn data_max(&self) -> &[f64] {
        &self.data_max
    }

    /// Scale one raw feature vector. A zero-width feature maps `x - min`
    /// straight onto the output range, so constants land on its lower bound.
    pub fn transform(&self, features: &[f64]) -> Result<NormalizedSample, ValidationError> {
        if features.len() != self.dimension() {
            return Err(ValidationError::ScalerDimension {
                expected: self.dimension(),
                got: features.len(),
            });
        }
        let (lo, hi) = self.feature_range;
        let scaled = features
            .iter()
            .zip(self.data_min.iter().zip(&self.data_max))
            .map(|(&x, (&min, &max))| {
                let span = max - min;
                let span = if span == 0.0 { 1.0 } else { span };
                (x - min) / span * (hi - lo) + lo
            })
            .collect::<Vec<_>>();
        Ok(NormalizedSample::from(scaled))
    }
}
