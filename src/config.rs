//! TOML configuration for the depinguard daemon.
//!
//! Every section carries `#[serde(default)]` so a partial file only overrides
//! what it names. Lookup order: explicit `--config` path, the
//! `DEPINGUARD_CONFIG` environment variable, `/etc/depinguard/depinguard.toml`,
//! then compiled-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ingest::FeatureSet;

/// Environment variable naming an alternate config file.
pub const CONFIG_ENV: &str = "DEPINGUARD_CONFIG";

/// Standard system location of the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/depinguard/depinguard.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the depinguard process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub scaler: ScalerConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub scorer: ScorerConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GuardConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded depinguard configuration");
        Ok(config)
    }

    /// Resolve configuration using the documented lookup order.
    ///
    /// An explicit path that fails to load is an error; the fallbacks only
    /// warn and move on.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "DEPINGUARD_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the HTTP API.
    pub bind: String,
    /// Upper bound on one ingest → decide → record pass, in milliseconds.
    pub pipeline_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            pipeline_timeout_ms: 5_000,
        }
    }
}

impl ServerConfig {
    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Window
// ---------------------------------------------------------------------------

/// Per-device sliding window settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Samples per window (`N`).
    pub length: usize,
    /// Which reading fields become features (`F`).
    pub features: FeatureSet,
    /// Hard cap on tracked devices; the least recently seen is evicted first.
    pub max_devices: usize,
    /// Devices silent for longer than this are dropped by the idle sweep.
    pub idle_ttl_secs: u64,
    /// How often the idle sweep runs.
    pub sweep_interval_secs: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            length: 30,
            features: FeatureSet::TemperatureVibration,
            max_devices: 10_000,
            idle_ttl_secs: 3_600,
            sweep_interval_secs: 60,
        }
    }
}

impl WindowConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// Scaler
// ---------------------------------------------------------------------------

/// Where the min-max scaler parameters come from.
///
/// `path` wins over the inline arrays; when neither is set the built-in
/// ranges for the configured feature set are used.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    /// JSON file written by `depinguard fit-scaler`.
    pub path: Option<PathBuf>,
    pub data_min: Option<Vec<f64>>,
    pub data_max: Option<Vec<f64>>,
    pub feature_range: (f64, f64),
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            path: None,
            data_min: None,
            data_max: None,
            feature_range: (0.0, 1.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Threshold and hard-limit rules for the decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Maximum reconstruction error seen on known-normal data.
    pub threshold: f64,
    /// Text file holding a single float; overrides `threshold` when set.
    pub threshold_path: Option<PathBuf>,
    /// Temperature above which a reading is always anomalous.
    pub temp_limit: f64,
    /// Vibration above which a reading is always anomalous.
    pub vibration_limit: f64,
    /// Apply the hard-limit rules while a device is still cold-starting.
    pub rules_during_cold_start: bool,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.05,
            threshold_path: None,
            temp_limit: 100.0,
            vibration_limit: 10.0,
            rules_during_cold_start: false,
        }
    }
}

impl DecisionConfig {
    /// Resolve the effective model threshold.
    pub fn resolve_threshold(&self) -> Result<f64> {
        let threshold = match &self.threshold_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read threshold file: {}", path.display()))?;
                text.trim()
                    .parse::<f64>()
                    .with_context(|| format!("invalid threshold in {}", path.display()))?
            }
            None => self.threshold,
        };
        anyhow::ensure!(
            threshold.is_finite() && threshold >= 0.0,
            "threshold must be a finite non-negative number, got {threshold}"
        );
        Ok(threshold)
    }
}

// ---------------------------------------------------------------------------
// Scorer
// ---------------------------------------------------------------------------

/// Which sequence scorer backs the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    /// Remote model-serving endpoint over HTTP.
    Http,
    /// In-process mean-reconstruction scorer.
    Baseline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    pub kind: ScorerKind,
    /// Endpoint for `kind = "http"`.
    pub url: String,
    /// Hard bound on one scoring call, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            kind: ScorerKind::Baseline,
            url: "http://127.0.0.1:5000/score".to_string(),
            timeout_ms: 2_000,
        }
    }
}

impl ScorerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Size of the recent-records read cache. The chain itself is unbounded.
    pub tail_capacity: usize,
    /// SQLite file mirroring every appended record. `None` keeps the chain in memory only.
    pub mirror_path: Option<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            tail_capacity: 100,
            mirror_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub history_capacity: usize,
    pub alerts_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            alerts_capacity: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level; `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
