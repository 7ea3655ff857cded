//! CARBITRAGE: vehicle import arbitrage pipeline
//!
//! Entry point. Initialises structured logging, loads configuration,
//! opens storage, wires the pipeline into the scheduler and serves the
//! control surface until a shutdown signal arrives.
//!
//! `carbitrage --once` runs a single full scrape and exits.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use carbitrage::config;
use carbitrage::dashboard::{self, routes::DashboardState};
use carbitrage::engine::pipeline::Pipeline;
use carbitrage::pricing::SharedPricing;
use carbitrage::scheduler::jobs::{self, FULL_SCRAPE};
use carbitrage::scheduler::Scheduler;
use carbitrage::storage;

const BANNER: &str = r#"
   ___   _   ___ ___ ___ _____ ___    _   ___ ___
  / __| /_\ | _ \ _ )_ _|_   _| _ \  /_\ / __| __|
 | (__ / _ \|   / _ \| |  | | |   / / _ \ (_ | _|
  \___/_/ \_\_|_\___/___| |_| |_|_\/_/ \_\___|___|

  Japan → Africa vehicle import arbitrage
  v0.1.0
"#;

/// How long in-flight runs get to finish their current write on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    init_logging();
    let cfg = config::AppConfig::load_or_default("config.toml")?;

    println!("{BANNER}");
    info!(
        service = %cfg.service.name,
        synthetic_only = cfg.sources.synthetic_only,
        backend = ?cfg.storage.backend,
        "CARBITRAGE starting up"
    );

    // -- Initialise components -------------------------------------------

    let pricing = SharedPricing::new(cfg.pricing.costs.clone(), cfg.pricing.exchange_rates.clone())?;
    let (store, audit) = storage::open(&cfg.storage).await?;
    let pipeline = Arc::new(Pipeline::from_config(&cfg, pricing.clone(), store.clone())?);

    let shutdown = CancellationToken::new();
    let mut scheduler = Scheduler::new(audit, shutdown.clone());
    for (job, cadence) in jobs::standard_jobs(&cfg, pipeline, pricing.clone())? {
        scheduler.register(job, cadence);
    }
    let scheduler = Arc::new(scheduler);

    if std::env::args().any(|a| a == "--once") {
        if let Some(record) = scheduler.run_once(FULL_SCRAPE).await? {
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        return Ok(());
    }

    // -- Run --------------------------------------------------------------

    scheduler.start_all();

    if cfg.dashboard.enabled {
        let state = Arc::new(DashboardState::new(scheduler.clone(), store, pricing));
        dashboard::spawn_dashboard(state, cfg.dashboard.port, shutdown.clone()).await?;
    }

    info!(jobs = ?scheduler.job_names(), "Scheduler running, press Ctrl+C to stop");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!(error = %e, "Failed to listen for shutdown signal, stopping"),
    }

    if !scheduler.shutdown(SHUTDOWN_GRACE).await {
        warn!("Exiting with runs still in flight");
    }
    info!("CARBITRAGE stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("carbitrage=info"));

    let json_logging = std::env::var("CARBITRAGE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
