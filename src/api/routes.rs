//! API route definitions.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::state::AppState;
use crate::error::{GuardError, LedgerError};
use crate::ingest::Reading;
use crate::ledger::ChainReport;

const DEFAULT_LIMIT: usize = 10;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/readings", post(submit_reading))
        .route("/counters", get(counters))
        .route("/history", get(history))
        .route("/alerts", get(alerts))
        .route("/records", get(records))
        .route("/chain/verify", get(verify_chain))
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct Envelope<T> {
    data: T,
    meta: Meta,
}

#[derive(Serialize)]
struct Meta {
    request_id: uuid::Uuid,
    timestamp: String,
    version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    total: Option<usize>,
}

fn envelope<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        data,
        meta: Meta {
            request_id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION"),
            total: None,
        },
    })
}

fn listing<T: Serialize>(items: Vec<T>) -> Json<Envelope<Vec<T>>> {
    let total = items.len();
    let mut body = envelope(items);
    body.meta.total = Some(total);
    body
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

impl LimitParams {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }
}

/// Pipeline error mapped onto an HTTP status.
struct ApiError(GuardError);

impl From<GuardError> for ApiError {
    fn from(e: GuardError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GuardError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GuardError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GuardError::Ledger(LedgerError::ConcurrencyViolation { .. })
            | GuardError::Ledger(LedgerError::ChainIntegrity { .. })
            | GuardError::Ledger(LedgerError::Serialization(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<Value> {
    let guard = &state.guard;
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "devices": guard.windows().device_count(),
            "chain_length": guard.ledger().len(),
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn submit_reading(
    State(state): State<AppState>,
    Json(reading): Json<Reading>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.guard.process(&reading).await?;
    Ok(envelope(outcome))
}

async fn counters(State(state): State<AppState>) -> impl IntoResponse {
    envelope(state.guard.get_counters())
}

async fn history(State(state): State<AppState>, Query(params): Query<LimitParams>) -> impl IntoResponse {
    listing(state.guard.get_recent_history(params.limit()))
}

async fn alerts(State(state): State<AppState>, Query(params): Query<LimitParams>) -> impl IntoResponse {
    listing(state.guard.get_recent_alerts(params.limit()))
}

async fn records(State(state): State<AppState>, Query(params): Query<LimitParams>) -> impl IntoResponse {
    listing(state.guard.get_recent_records(params.limit()))
}

#[derive(Serialize)]
struct ChainStatus {
    #[serde(flatten)]
    report: ChainReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    alert: Option<Value>,
}

async fn verify_chain(State(state): State<AppState>) -> Response {
    let guard = state.guard.clone();
    let report = match tokio::task::spawn_blocking(move || guard.verify_chain()).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, "chain verification task failed");
            let body = json!({
                "error": {
                    "code": "INTERNAL_ERROR",
                    "message": "chain verification failed to run",
                }
            });
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
        }
    };

    let alert = report.check().err().map(|e| {
        let e = GuardError::from(e);
        json!({ "code": e.code(), "message": e.to_string() })
    });
    envelope(ChainStatus { report, alert }).into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
