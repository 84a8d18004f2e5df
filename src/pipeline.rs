//! The ingest → decide → record pipeline and its read-only query surface.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregator::{Aggregator, Alert, Counters, HistoryEntry};
use crate::config::GuardConfig;
use crate::detect::{build_scorer, DecisionEngine, Reason, Severity, Verdict};
use crate::error::GuardError;
use crate::ingest::{MinMaxScaler, Reading, WindowManager};
use crate::ledger::{spawn_writer, ChainReport, Ledger, Record, RecordMirror};
use crate::storage::SqliteMirror;

/// What gets hashed into the ledger for one anomalous reading.
#[derive(Debug, Serialize)]
pub struct EventPayload<'a> {
    pub device_id: &'a str,
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub vibration: f64,
    pub power_usage: f64,
    pub score: Option<f64>,
    pub threshold: f64,
    pub reason: Reason,
    pub severity: Severity,
    pub model_unavailable: bool,
    pub recommendation: &'a str,
}

impl<'a> EventPayload<'a> {
    pub fn new(reading: &'a Reading, verdict: &'a Verdict) -> Self {
        Self {
            device_id: &reading.device_id,
            timestamp: reading.timestamp,
            temperature: reading.temperature,
            vibration: reading.vibration,
            power_usage: reading.power_usage,
            score: verdict.score,
            threshold: verdict.threshold,
            reason: verdict.reason,
            severity: verdict.severity,
            model_unavailable: verdict.model_unavailable,
            recommendation: &verdict.recommendation,
        }
    }
}

/// Result of one full pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub verdict: Verdict,
    /// Present when the reading was anomalous and recorded.
    pub record: Option<Record>,
}

pub struct Guard {
    windows: WindowManager,
    engine: DecisionEngine,
    ledger: Ledger,
    aggregator: Aggregator,
    pipeline_timeout: Duration,
}

impl Guard {
    pub fn new(
        windows: WindowManager,
        engine: DecisionEngine,
        ledger: Ledger,
        aggregator: Aggregator,
        pipeline_timeout: Duration,
    ) -> Self {
        Self {
            windows,
            engine,
            ledger,
            aggregator,
            pipeline_timeout,
        }
    }

    /// Assemble the pipeline from config. When a mirror path is configured
    /// the stored chain is restored first and a writer task is started, so
    /// this must run inside a Tokio runtime.
    pub async fn from_config(config: &GuardConfig) -> Result<Self> {
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

        let mut ledger = Ledger::new(config.ledger.tail_capacity);
        if let Some(path) = &config.ledger.mirror_path {
            let mirror = SqliteMirror::open(path)?;
            let loader = mirror.clone();
            let records = tokio::task::spawn_blocking(move || loader.load_all())
                .await
                .context("ledger restore task failed")??;
            ledger.restore(records);

            let (tx, rx) = mpsc::unbounded_channel();
            let mirror: Arc<dyn RecordMirror> = Arc::new(mirror);
            spawn_writer(mirror, rx);
            ledger = ledger.with_mirror(tx);
            info!(path = %path.display(), records = ledger.len(), "ledger mirror attached");
        }

        info!(
            window = windows.length(),
            features = windows.feature_count(),
            threshold = engine.threshold(),
            "pipeline ready"
        );

        Ok(Self::new(
            windows,
            engine,
            ledger,
            Aggregator::new(&config.aggregator),
            config.server.pipeline_timeout(),
        ))
    }

    /// Push a reading into its window and decide on it.
    pub async fn ingest_and_decide(&self, reading: &Reading) -> Result<Verdict, GuardError> {
        let pushed = match self.windows.ingest(reading) {
            Ok((snapshot, _ready)) => self.engine.decide(&snapshot, reading).await,
            Err(e) => Err(e),
        };
        let verdict = match pushed {
            Ok(verdict) => verdict,
            Err(e) => {
                self.aggregator.record_rejected();
                warn!(device_id = %reading.device_id, error = %e, "reading rejected");
                return Err(e.into());
            }
        };

        self.aggregator.record_decision(reading, &verdict);
        Ok(verdict)
    }

    /// Append an anomalous reading to the ledger.
    pub fn record_event(&self, reading: &Reading, verdict: &Verdict) -> Result<Record, GuardError> {
        let record = self
            .ledger
            .append(&reading.device_id, &EventPayload::new(reading, verdict))?;
        self.aggregator.record_append(verdict, &record);
        info!(
            device_id = %reading.device_id,
            index = record.index,
            reason = ?verdict.reason,
            "anomaly recorded"
        );
        Ok(record)
    }

    /// Full pass under the pipeline timeout.
    ///
    /// Window updates and ledger appends are synchronous, so dropping this
    /// future at its only await point (the scorer) leaves the window pushed
    /// and the ledger untouched.
    pub async fn process(&self, reading: &Reading) -> Result<Outcome, GuardError> {
        let pass = async {
            let verdict = self.ingest_and_decide(reading).await?;
            let record = if verdict.is_anomaly {
                Some(self.record_event(reading, &verdict)?)
            } else {
                None
            };
            Ok::<_, GuardError>(Outcome { verdict, record })
        };

        match tokio::time::timeout(self.pipeline_timeout, pass).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(device_id = %reading.device_id, timeout = ?self.pipeline_timeout, "pipeline timed out");
                Err(GuardError::Timeout(self.pipeline_timeout))
            }
        }
    }

    pub fn get_counters(&self) -> Counters {
        self.aggregator.counters()
    }

    pub fn get_recent_history(&self, k: usize) -> Vec<HistoryEntry> {
        self.aggregator.recent_history(k)
    }

    pub fn get_recent_alerts(&self, k: usize) -> Vec<Alert> {
        self.aggregator.recent_alerts(k)
    }

    pub fn get_recent_records(&self, k: usize) -> Vec<Record> {
        self.ledger.tail(k)
    }

    pub fn verify_chain(&self) -> ChainReport {
        self.ledger.verify()
    }

    pub fn windows(&self) -> &WindowManager {
        &self.windows
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Block until every appended record has reached the mirror.
    pub async fn flush(&self) {
        self.ledger.flush_mirror().await;
    }
}

/// Periodically drop device windows idle for longer than `ttl`.
pub fn spawn_idle_sweeper(guard: Arc<Guard>, interval: Duration, ttl: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = guard.windows().evict_idle(ttl);
            debug!(evicted, devices = guard.windows().device_count(), "idle sweep");
        }
    })
}
