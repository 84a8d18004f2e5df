//! Error taxonomy shared across the ingest, decision and ledger layers.

use thiserror::Error;

/// A reading or sequence that must be rejected outright. Nothing is buffered.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("device_id must not be empty")]
    EmptyDeviceId,

    #[error("field `{field}` is not a finite number: {value}")]
    NonFinite { field: &'static str, value: f64 },

    #[error("sequence shape mismatch: expected {expected_len}x{expected_features}, got {got_len}x{got_features}")]
    ShapeMismatch {
        expected_len: usize,
        expected_features: usize,
        got_len: usize,
        got_features: usize,
    },

    #[error("scaler expects {expected} features, got {got}")]
    ScalerDimension { expected: usize, got: usize },
}

/// Failure to obtain a score from the sequence scorer. Never fails a
/// request; the decision degrades to rules only.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScorerError {
    #[error("scorer timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("scorer transport failure: {0}")]
    Transport(String),

    #[error("scorer returned a non-finite score: {0}")]
    InvalidScore(f64),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Ledger append / verification failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("payload serialization failed: {0}")]
    Serialization(String),

    /// Reported alongside a `ChainReport`; the chain is never repaired.
    #[error("chain integrity broken at record {index} of {length}")]
    ChainIntegrity { index: u64, length: u64 },

    /// Two writers raced past the append critical section. Structurally
    /// impossible under the ledger lock; seeing it means a defect.
    #[error("concurrency violation at record {index}: {reason}")]
    ConcurrencyViolation { index: u64, reason: String },
}

/// Top-level error for one pass through the pipeline.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("pipeline timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl GuardError {
    /// Short machine-readable code used by the HTTP layer.
    pub fn code(&self) -> &'static str {
        match self {
            GuardError::Validation(_) => "VALIDATION_ERROR",
            GuardError::Ledger(LedgerError::ChainIntegrity { .. }) => "CHAIN_INTEGRITY_ERROR",
            GuardError::Ledger(LedgerError::ConcurrencyViolation { .. }) => "CONCURRENCY_VIOLATION",
            GuardError::Ledger(LedgerError::Serialization(_)) => "LEDGER_ERROR",
            GuardError::Timeout(_) => "PIPELINE_TIMEOUT",
        }
    }
}
