//! Sequence scorer port and its two built-in adapters.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{ScorerConfig, ScorerKind};
use crate::error::{ScorerError, ValidationError};

/// Opaque `[N][F] -> f64` anomaly scorer. Larger is more anomalous.
#[async_trait::async_trait]
pub trait SequenceScorer: Send + Sync {
    async fn score(&self, sequence: &[Vec<f64>]) -> Result<f64, ScorerError>;

    /// Short label for logs.
    fn name(&self) -> &'static str;
}

/// Reject anything that is not exactly `len × features`.
pub fn check_shape(sequence: &[Vec<f64>], len: usize, features: usize) -> Result<(), ValidationError> {
    let got_features = sequence
        .iter()
        .map(Vec::len)
        .find(|&n| n != features)
        .unwrap_or(features);
    if sequence.len() != len || got_features != features {
        return Err(ValidationError::ShapeMismatch {
            expected_len: len,
            expected_features: features,
            got_len: sequence.len(),
            got_features,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

/// In-process scorer needing no model: each sample is reconstructed as its
/// projection onto the scaler's output range, and the score is the mean
/// squared reconstruction error. Sequences that stay inside the fitted
/// envelope score zero.
pub struct BaselineScorer {
    feature_range: (f64, f64),
}

impl BaselineScorer {
    pub fn new(feature_range: (f64, f64)) -> Self {
        Self { feature_range }
    }
}

#[async_trait::async_trait]
impl SequenceScorer for BaselineScorer {
    async fn score(&self, sequence: &[Vec<f64>]) -> Result<f64, ScorerError> {
        let (lo, hi) = self.feature_range;
        let mut total = 0.0;
        let mut count = 0usize;
        for x in sequence.iter().flatten() {
            let err = x - x.clamp(lo, hi);
            total += err * err;
            count += 1;
        }
        if count == 0 {
            return Ok(0.0);
        }
        let mse = total / count as f64;
        if !mse.is_finite() {
            return Err(ScorerError::InvalidScore(mse));
        }
        Ok(mse)
    }

    fn name(&self) -> &'static str {
        "baseline"
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ScoreRequest<'a> {
    sequence: &'a [Vec<f64>],
}

#[derive(Deserialize)]
struct ScoreResponse {
    #[serde(alias = "score", alias = "reconstruction_error")]
    anomaly_score: f64,
}

/// Calls a model-serving endpoint with `{"sequence": [[..], ..]}` and reads
/// `anomaly_score` (or `score` / `reconstruction_error`) back.
pub struct HttpScorer {
    client: Client,
    url: String,
}

impl HttpScorer {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build scorer HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl SequenceScorer for HttpScorer {
    async fn score(&self, sequence: &[Vec<f64>]) -> Result<f64, ScorerError> {
        let response = self
            .client
            .post(&self.url)
            .json(&ScoreRequest { sequence })
            .send()
            .await
            .map_err(|e| ScorerError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScorerError::Transport(format!("scorer returned HTTP {status}")));
        }

        let body: ScoreResponse = response
            .json()
            .await
            .map_err(|e| ScorerError::Transport(format!("malformed scorer response: {e}")))?;
        if !body.anomaly_score.is_finite() {
            return Err(ScorerError::InvalidScore(body.anomaly_score));
        }
        debug!(url = %self.url, score = body.anomaly_score, "remote score");
        Ok(body.anomaly_score)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Build the scorer selected in config.
pub fn build_scorer(config: &ScorerConfig, feature_range: (f64, f64)) -> Result<Arc<dyn SequenceScorer>> {
    let scorer: Arc<dyn SequenceScorer> = match config.kind {
        ScorerKind::Baseline => Arc::new(BaselineScorer::new(feature_range)),
        ScorerKind::Http => Arc::new(HttpScorer::new(&config.url, config.timeout())?),
    };
    info!(scorer = scorer.name(), timeout_ms = config.timeout_ms, "sequence scorer ready");
    Ok(scorer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::{json, Value};

    #[test]
    fn test_check_shape() {
        let ok = vec![vec![0.1, 0.2]; 3];
        assert!(check_shape(&ok, 3, 2).is_ok());

        let short = vec![vec![0.1, 0.2]; 2];
        assert_eq!(
            check_shape(&short, 3, 2),
            Err(ValidationError::ShapeMismatch {
                expected_len: 3,
                expected_features: 2,
                got_len: 2,
                got_features: 2,
            })
        );

        let ragged = vec![vec![0.1, 0.2], vec![0.1], vec![0.1, 0.2]];
        assert!(matches!(
            check_shape(&ragged, 3, 2),
            Err(ValidationError::ShapeMismatch { got_features: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_baseline_scores_zero_inside_envelope() {
        let scorer = BaselineScorer::new((0.0, 1.0));
        let seq = vec![vec![0.2, 0.9]; 30];
        assert_eq!(scorer.score(&seq).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_baseline_penalises_excursions() {
        let scorer = BaselineScorer::new((0.0, 1.0));
        let mut seq = vec![vec![0.5, 0.5]; 4];
        seq[3] = vec![3.0, -1.0];
        // (2^2 + 1^2) / 8
        assert_eq!(scorer.score(&seq).await.unwrap(), 0.625);
    }

    async fn spawn_model(reply: Value) -> String {
        let app = Router::new().route(
            "/score",
            post(move |Json(body): Json<Value>| {
                let reply = reply.clone();
                async move {
                    assert!(body["sequence"].is_array());
                    Json(reply)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/score")
    }

    #[tokio::test]
    async fn test_http_scorer_reads_score() {
        let url = spawn_model(json!({"anomaly_score": 0.31, "status": "active"})).await;
        let scorer = HttpScorer::new(url, Duration::from_secs(2)).unwrap();
        let score = scorer.score(&vec![vec![0.1, 0.2]; 30]).await.unwrap();
        assert_eq!(score, 0.31);
    }

    #[tokio::test]
    async fn test_http_scorer_accepts_alias() {
        let url = spawn_model(json!({"reconstruction_error": 0.02})).await;
        let scorer = HttpScorer::new(url, Duration::from_secs(2)).unwrap();
        assert_eq!(scorer.score(&[vec![0.0, 0.0]]).await.unwrap(), 0.02);
    }

    #[tokio::test]
    async fn test_http_scorer_transport_error() {
        let url = spawn_model(json!({"error": "model not loaded"})).await;
        let scorer = HttpScorer::new(url, Duration::from_secs(2)).unwrap();
        assert!(matches!(
            scorer.score(&[vec![0.0, 0.0]]).await,
            Err(ScorerError::Transport(_))
        ));

        let unreachable = HttpScorer::new("http://127.0.0.1:9/score", Duration::from_millis(200)).unwrap();
        assert!(matches!(
            unreachable.score(&[vec![0.0, 0.0]]).await,
            Err(ScorerError::Transport(_))
        ));
    }
}
