//! Control-surface route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<DashboardState>`.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::pricing::{CostParameters, CostUpdate, ExchangeRates, PricingSnapshot, SharedPricing};
use crate::scheduler::jobs::{FULL_SCRAPE, REFRESH};
use crate::scheduler::{JobReport, Scheduler, TriggerOutcome};
use crate::storage::{ListingStore, RecordFilter, RecordQuery};
use crate::types::{ArbError, JobExecutionRecord};

/// Score at or above which a listing counts as high-scoring in `/api/stats`.
const HIGH_SCORE: u8 = 70;
const DEFAULT_LOG_LIMIT: usize = 50;
const MAX_LOG_LIMIT: usize = 500;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct DashboardState {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<dyn ListingStore>,
    pub pricing: SharedPricing,
    pub started_at: DateTime<Utc>,
}

impl DashboardState {
    pub fn new(scheduler: Arc<Scheduler>, store: Arc<dyn ListingStore>, pricing: SharedPricing) -> Self {
        Self {
            scheduler,
            store,
            pricing,
            started_at: Utc::now(),
        }
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub backend: &'static str,
    pub uptime_secs: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub job: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerResponse {
    pub job: String,
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub active: u64,
    pub scored: u64,
    pub high_score: u64,
    /// Mean profit over active listings with positive profit.
    pub average_profit: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    Internal(anyhow::Error),
    NotFound(String),
    BadRequest(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<ArbError> for ApiError {
    fn from(err: ArbError) -> Self {
        match err {
            ArbError::UnknownJob(_) => ApiError::NotFound(err.to_string()),
            ArbError::InvalidConfig(_) | ArbError::InvalidRate { .. } => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        backend: state.store.backend(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

/// GET /api/jobs
pub async fn get_jobs(State(state): State<AppState>) -> Json<Vec<JobReport>> {
    Json(state.scheduler.status())
}

/// GET /api/jobs/logs?job=&limit=
pub async fn get_job_logs(
    State(state): State<AppState>,
    Query(q): Query<LogQuery>,
) -> Result<Json<Vec<JobExecutionRecord>>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);
    let records = state.scheduler.audit().recent(q.job.as_deref(), limit).await?;
    Ok(Json(records))
}

fn trigger(state: &DashboardState, job: &str) -> Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    let (code, status) = match state.scheduler.trigger(job)? {
        TriggerOutcome::Started => (StatusCode::ACCEPTED, "started"),
        TriggerOutcome::AlreadyRunning => (StatusCode::CONFLICT, "already running"),
    };
    Ok((
        code,
        Json(TriggerResponse {
            job: job.to_string(),
            status,
        }),
    ))
}

/// POST /api/scrape/full
pub async fn trigger_full_scrape(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    trigger(&state, FULL_SCRAPE)
}

/// POST /api/scrape/refresh
pub async fn trigger_refresh(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    trigger(&state, REFRESH)
}

/// GET /api/pricing
pub async fn get_pricing(State(state): State<AppState>) -> Json<PricingSnapshot> {
    Json(state.pricing.snapshot().as_ref().clone())
}

/// POST /api/pricing/costs
pub async fn update_costs(
    State(state): State<AppState>,
    Json(update): Json<CostUpdate>,
) -> Result<Json<CostParameters>, ApiError> {
    Ok(Json(state.pricing.update_costs(&update)?))
}

/// POST /api/pricing/rates
pub async fn update_rates(
    State(state): State<AppState>,
    Json(mut rates): Json<ExchangeRates>,
) -> Result<Json<ExchangeRates>, ApiError> {
    rates.as_of.get_or_insert_with(Utc::now);
    state.pricing.set_rates(rates.clone())?;
    Ok(Json(rates))
}

/// GET /api/stats
pub async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let store = &state.store;
    let active = store.count(&RecordFilter::active()).await?;
    let scored = store.count(&RecordFilter::active().scored()).await?;
    let high_score = store
        .count(&RecordFilter::active().scored().min_score(HIGH_SCORE))
        .await?;

    let profits: Vec<Decimal> = store
        .find(&RecordQuery::new(RecordFilter::active().scored()))
        .await?
        .into_iter()
        .filter_map(|r| r.estimated_profit)
        .filter(|p| *p > Decimal::ZERO)
        .collect();
    let average_profit = if profits.is_empty() {
        None
    } else {
        let sum: Decimal = profits.iter().sum();
        Some((sum / Decimal::from(profits.len())).round_dp(2))
    };

    Ok(Json(StatsResponse {
        active,
        scored,
        high_score,
        average_profit,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
