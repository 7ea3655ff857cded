//! The four standing jobs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{Cadence, ScheduledJob};
use crate::config::AppConfig;
use crate::engine::pipeline::Pipeline;
use crate::pricing::rates::ExchangeRateClient;
use crate::pricing::SharedPricing;

pub const FULL_SCRAPE: &str = "daily_full_scrape";
pub const REFRESH: &str = "hourly_updates";
pub const EXCHANGE_RATE: &str = "exchange_rate_update";
pub const CLEANUP: &str = "database_cleanup";

pub struct FullScrapeJob {
    pipeline: Arc<Pipeline>,
}

impl FullScrapeJob {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl ScheduledJob for FullScrapeJob {
    fn name(&self) -> &str {
        FULL_SCRAPE
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<serde_json::Value> {
        let summary = self.pipeline.run_full_scrape(cancel).await?;
        Ok(serde_json::to_value(summary)?)
    }
}

pub struct RefreshJob {
    pipeline: Arc<Pipeline>,
}

impl RefreshJob {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl ScheduledJob for RefreshJob {
    fn name(&self) -> &str {
        REFRESH
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<serde_json::Value> {
        let summary = self.pipeline.refresh_existing(cancel).await?;
        Ok(serde_json::to_value(summary)?)
    }
}

/// Pulls a fresh rate snapshot. A failed fetch leaves the previous pair in
/// effect and surfaces as this job's error record.
pub struct ExchangeRateJob {
    client: ExchangeRateClient,
    pricing: SharedPricing,
}

impl ExchangeRateJob {
    pub fn new(client: ExchangeRateClient, pricing: SharedPricing) -> Self {
        Self { client, pricing }
    }
}

#[async_trait]
impl ScheduledJob for ExchangeRateJob {
    fn name(&self) -> &str {
        EXCHANGE_RATE
    }

    async fn run(&self, _cancel: &CancellationToken) -> Result<serde_json::Value> {
        let rates = self
            .client
            .refresh(&self.pricing)
            .await
            .context("Exchange-rate update failed, keeping previous rates")?;
        Ok(serde_json::to_value(rates)?)
    }
}

pub struct CleanupJob {
    pipeline: Arc<Pipeline>,
}

impl CleanupJob {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl ScheduledJob for CleanupJob {
    fn name(&self) -> &str {
        CLEANUP
    }

    async fn run(&self, _cancel: &CancellationToken) -> Result<serde_json::Value> {
        let summary = self.pipeline.cleanup().await?;
        Ok(serde_json::to_value(summary)?)
    }
}

/// The standing jobs with their configured schedules.
pub fn standard_jobs(
    config: &AppConfig,
    pipeline: Arc<Pipeline>,
    pricing: SharedPricing,
) -> Result<Vec<(Arc<dyn ScheduledJob>, Cadence)>> {
    let s = &config.schedule;
    let client = ExchangeRateClient::new(
        &config.pricing.rate_url,
        &config.service.source_currency,
        Duration::from_secs(config.pricing.rate_timeout_secs),
    )?;
    Ok(vec![
        (
            Arc::new(FullScrapeJob::new(pipeline.clone())) as Arc<dyn ScheduledJob>,
            s.full_scrape.cadence()?,
        ),
        (
            Arc::new(RefreshJob::new(pipeline.clone())) as Arc<dyn ScheduledJob>,
            s.refresh.cadence()?,
        ),
        (
            Arc::new(ExchangeRateJob::new(client, pricing)) as Arc<dyn ScheduledJob>,
            s.exchange_rate.cadence()?,
        ),
        (
            Arc::new(CleanupJob::new(pipeline)) as Arc<dyn ScheduledJob>,
            s.cleanup.cadence()?,
        ),
    ])
}
