use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::config::{DecisionConfig, ScorerConfig};
use crate::detect::scorer::{check_shape, SequenceScorer};
use crate::detect::{Reason, Severity, Verdict};
use crate::error::{ScorerError, ValidationError};
use crate::ingest::{Reading, WindowSnapshot, WindowState};

/// Deterministic safety limits applied to the raw reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleLimits {
    pub temp_limit: f64,
    pub vibration_limit: f64,
}

impl RuleLimits {
    /// Highest-precedence rule the reading violates, if any.
    fn violation(&self, reading: &Reading) -> Option<Reason> {
        if reading.temperature > self.temp_limit {
            Some(Reason::RuleTemp)
        } else if reading.vibration > self.vibration_limit {
            Some(Reason::RuleVibration)
        } else {
            None
        }
    }
}

/// Fuses the sequence score with the rule limits.
pub struct DecisionEngine {
    scorer: Arc<dyn SequenceScorer>,
    threshold: f64,
    limits: RuleLimits,
    timeout: Duration,
    length: usize,
    features: usize,
    rules_during_cold_start: bool,
}

impl DecisionEngine {
    pub fn new(
        scorer: Arc<dyn SequenceScorer>,
        threshold: f64,
        limits: RuleLimits,
        timeout: Duration,
        shape: (usize, usize),
    ) -> Self {
        Self {
            scorer,
            threshold,
            limits,
            timeout,
            length: shape.0,
            features: shape.1,
            rules_during_cold_start: false,
        }
    }

    pub fn from_config(
        decision: &DecisionConfig,
        scorer_cfg: &ScorerConfig,
        scorer: Arc<dyn SequenceScorer>,
        shape: (usize, usize),
    ) -> Result<Self> {
        let limits = RuleLimits {
            temp_limit: decision.temp_limit,
            vibration_limit: decision.vibration_limit,
        };
        let engine = Self::new(scorer, decision.resolve_threshold()?, limits, scorer_cfg.timeout(), shape)
            .with_rules_during_cold_start(decision.rules_during_cold_start);
        Ok(engine)
    }

    pub fn with_rules_during_cold_start(mut self, enabled: bool) -> Self {
        self.rules_during_cold_start = enabled;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn limits(&self) -> RuleLimits {
        self.limits
    }

    /// Score one sequence under the configured timeout, with the shape contract enforced.
    pub async fn score(&self, sequence: &[Vec<f64>]) -> Result<f64, ScorerError> {
        check_shape(sequence, self.length, self.features)?;
        let score = tokio::time::timeout(self.timeout, self.scorer.score(sequence))
            .await
            .map_err(|_| ScorerError::Timeout(self.timeout))??;
        if !score.is_finite() {
            return Err(ScorerError::InvalidScore(score));
        }
        Ok(score)
    }

    /// Decide on one reading given its device window.
    ///
    /// Only a window of the wrong shape is rejected. A scorer error degrades
    /// to a rule-only verdict with `model_unavailable` set.
    pub async fn decide(&self, snapshot: &WindowSnapshot, reading: &Reading) -> Result<Verdict, ValidationError> {
        let state = snapshot.state();
        let buffer_size = snapshot.len();

        if state == WindowState::ColdStart {
            let rule = if self.rules_during_cold_start {
                self.limits.violation(reading)
            } else {
                None
            };
            return Ok(self.verdict(reading, state, buffer_size, None, rule, false, false));
        }

        let sequence = snapshot.sequence();
        check_shape(&sequence, self.length, self.features)?;
        let (score, model_unavailable) = match self.score(&sequence).await {
            Ok(score) => (Some(score), false),
            Err(e) => {
                warn!(
                    device_id = %reading.device_id,
                    scorer = self.scorer.name(),
                    error = %e,
                    "scorer unavailable, falling back to rule-only decision"
                );
                (None, true)
            }
        };

        let model_flag = score.is_some_and(|s| s > self.threshold);
        let rule = self.limits.violation(reading);
        let verdict = self.verdict(reading, state, buffer_size, score, rule, model_flag, model_unavailable);
        debug!(
            device_id = %reading.device_id,
            score = ?verdict.score,
            reason = ?verdict.reason,
            is_anomaly = verdict.is_anomaly,
            "decision"
        );
        Ok(verdict)
    }

    #[allow(clippy::too_many_arguments)]
    fn verdict(
        &self,
        reading: &Reading,
        state: WindowState,
        buffer_size: usize,
        score: Option<f64>,
        rule: Option<Reason>,
        model_flag: bool,
        model_unavailable: bool,
    ) -> Verdict {
        let reason = match rule {
            Some(rule) => rule,
            None if model_flag => Reason::Model,
            None => Reason::None,
        };
        let severity = match reason {
            Reason::RuleTemp => Severity::Critical,
            Reason::RuleVibration | Reason::Model => Severity::Warning,
            Reason::None => Severity::Info,
        };
        let recommendation = recommend(reason, state, model_unavailable, buffer_size, self.length);

        Verdict {
            device_id: reading.device_id.clone(),
            is_anomaly: reason != Reason::None,
            score,
            threshold: self.threshold,
            state,
            reason,
            model_unavailable,
            recommendation,
            severity,
            buffer_size,
            window_len: self.length,
        }
    }
}

fn recommend(
    reason: Reason,
    state: WindowState,
    model_unavailable: bool,
    buffer_size: usize,
    length: usize,
) -> String {
    match (reason, model_unavailable) {
        (Reason::RuleTemp, true) => "CRITICAL: Overheating (model offline).".to_string(),
        (Reason::RuleTemp, false) => "CRITICAL: Overheating detected. Cooling fan failure likely.".to_string(),
        (Reason::RuleVibration, _) => "WARNING: Severe mechanical vibration. Check mounting.".to_string(),
        (Reason::Model, _) => "ALERT: Model detected an unknown anomaly pattern.".to_string(),
        (Reason::None, _) if state == WindowState::ColdStart => {
            format!("Initializing: {buffer_size}/{length} readings buffered.")
        }
        (Reason::None, true) => "Normal operation (model offline, rules only).".to_string(),
        (Reason::None, false) => "Normal operation.".to_string(),
    }
}
