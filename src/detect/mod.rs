//! Hybrid anomaly decisions: sequence score fused with hard-limit rules.

pub mod engine;
pub mod scorer;
pub mod stats;

use serde::{Deserialize, Serialize};

use crate::ingest::WindowState;

pub use engine::{DecisionEngine, RuleLimits};
pub use scorer::{build_scorer, BaselineScorer, HttpScorer, SequenceScorer};

/// Severity levels for verdicts and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Which signal drove the decision. Precedence is
/// `RuleTemp > RuleVibration > Model > None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    None,
    Model,
    RuleTemp,
    RuleVibration,
}

/// Outcome of one decision. Produced fresh per reading, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub device_id: String,
    pub is_anomaly: bool,
    /// `None` during cold start or when the scorer was unavailable.
    pub score: Option<f64>,
    pub threshold: f64,
    pub state: WindowState,
    pub reason: Reason,
    pub model_unavailable: bool,
    pub recommendation: String,
    pub severity: Severity,
    /// Samples currently buffered for the device.
    pub buffer_size: usize,
    /// Window length `N`.
    pub window_len: usize,
}

impl Verdict {
    pub fn is_degraded(&self) -> bool {
        self.model_unavailable
    }
}
