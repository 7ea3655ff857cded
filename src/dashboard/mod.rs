//! Dashboard: Axum control surface for the running pipeline.
//!
//! Job status, the audit trail, fire-and-forget triggers, pricing inputs
//! and listing stats. CORS enabled for local development.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use routes::AppState;

/// Bind the port and serve in a background task until `shutdown` fires.
pub async fn spawn_dashboard(state: AppState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind dashboard port {port}"))?;
    info!(port, "Dashboard server starting on http://localhost:{port}");

    tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            error!(error = %e, "Dashboard server error");
        }
    });

    Ok(())
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/jobs", get(routes::get_jobs))
        .route("/api/jobs/logs", get(routes::get_job_logs))
        .route("/api/scrape/full", post(routes::trigger_full_scrape))
        .route("/api/scrape/refresh", post(routes::trigger_refresh))
        .route("/api/pricing", get(routes::get_pricing))
        .route("/api/pricing/costs", post(routes::update_costs))
        .route("/api/pricing/rates", post(routes::update_rates))
        .route("/api/stats", get(routes::get_stats))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
