//! Offline fitting: scaler bounds and the model threshold.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::GuardConfig;
use crate::detect::stats::{ScoreSeries, ScoreSummary};
use crate::detect::{build_scorer, DecisionEngine};
use crate::ingest::{FeatureSet, MinMaxScaler, Reading, WindowManager};

/// Read newline-delimited JSON readings. Blank lines are skipped.
pub fn read_readings(path: &Path) -> Result<Vec<Reading>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open readings file: {}", path.display()))?;
    parse_readings(BufReader::new(file))
        .with_context(|| format!("failed to parse readings file: {}", path.display()))
}

pub fn parse_readings(reader: impl BufRead) -> Result<Vec<Reading>> {
    let mut readings = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let reading: Reading =
            serde_json::from_str(&line).with_context(|| format!("line {}: invalid reading", n + 1))?;
        readings.push(reading);
    }
    Ok(readings)
}

/// Fit scaler bounds on readings assumed to be normal. Invalid readings are skipped.
pub fn fit_scaler(readings: &[Reading], set: FeatureSet, feature_range: (f64, f64)) -> Result<MinMaxScaler> {
    let rows: Vec<Vec<f64>> = readings
        .iter()
        .filter(|r| r.validate().is_ok())
        .map(|r| r.features(set))
        .collect();
    let skipped = readings.len() - rows.len();
    if skipped > 0 {
        warn!(skipped, "ignored invalid readings while fitting scaler");
    }
    let scaler = MinMaxScaler::fit(&rows, feature_range)?;
    info!(rows = rows.len(), min = ?scaler.data_min(), max = ?scaler.data_max(), "scaler fitted");
    Ok(scaler)
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Calibration {
    /// Largest score seen on normal data; the recommended threshold.
    pub threshold: f64,
    pub summary: ScoreSummary,
}

/// Score every full window of known-normal readings and derive the threshold.
pub async fn calibrate(config: &GuardConfig, readings: &[Reading]) -> Result<Calibration> {
    let features = config.window.features;
    let scaler = Arc::new(MinMaxScaler::from_config(&config.scaler, features)?);
    let windows = WindowManager::new(&config.window, scaler);
    let scorer = build_scorer(&config.scorer, config.scaler.feature_range)?;
    let engine = DecisionEngine::from_config(
        &config.decision,
        &config.scorer,
        scorer,
        (windows.length(), windows.feature_count()),
    )?;

    let mut scores = ScoreSeries::new(Vec::new());
    for reading in readings {
        let Ok((snapshot, ready)) = windows.ingest(reading) else {
            continue;
        };
        if ready {
            let score = engine
                .score(&snapshot.sequence())
                .await
                .with_context(|| format!("scoring failed for device {}", reading.device_id))?;
            scores.push(score);
        }
    }

    let summary = scores.summary().with_context(|| {
        format!(
            "no device produced a full window of {} readings",
            windows.length()
        )
    })?;
    info!(
        sequences = summary.count,
        mean = summary.mean,
        std_dev = summary.std_dev,
        max = summary.max,
        "calibration complete"
    );
    Ok(Calibration {
        threshold: summary.max,
        summary,
    })
}

pub fn write_threshold(path: &Path, threshold: f64) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, format!("{threshold}\n"))
        .with_context(|| format!("failed to write threshold file: {}", path.display()))
}
