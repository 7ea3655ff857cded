//! Pipeline orchestrator: acquisition → valuation → scoring → persistence.
//!
//! The orchestrator is the only place a [`ListingRecord`] becomes an
//! [`ArbitrageRecord`]. Item-level problems (no valuation, unscoreable
//! price) drop the item; persistence problems fail the run.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::acquirer::ListingSource;
use super::reconciler::Reconciler;
use super::valuer::Valuer;
use crate::config::{AppConfig, RetentionConfig};
use crate::pricing::profitability::ProfitabilityEngine;
use crate::pricing::SharedPricing;
use crate::storage::ListingStore;
use crate::types::{
    ArbError, ArbitrageRecord, CleanupSummary, ListingRecord, RefreshSummary, ScrapeSummary, SearchParams,
    VehicleQuery,
};

pub struct Pipeline {
    source: ListingSource,
    valuer: Valuer,
    engine: ProfitabilityEngine,
    reconciler: Reconciler,
    retention: RetentionConfig,
    source_currency: String,
    search: SearchParams,
}

impl Pipeline {
    pub fn new(
        source: ListingSource,
        valuer: Valuer,
        engine: ProfitabilityEngine,
        reconciler: Reconciler,
        retention: RetentionConfig,
        source_currency: &str,
    ) -> Self {
        Self {
            source,
            valuer,
            engine,
            reconciler,
            retention,
            source_currency: source_currency.to_string(),
            search: SearchParams::default(),
        }
    }

    /// Wire providers, tiers and the reconciler from config.
    pub fn from_config(config: &AppConfig, pricing: SharedPricing, store: Arc<dyn ListingStore>) -> Result<Self> {
        let source = ListingSource::from_config(&config.sources)?;
        let valuer = Valuer::from_config(&config.valuation, config.sources.synthetic_only)?;
        info!(
            providers = ?source.provider_names(),
            live_valuation = valuer.has_live_tiers(),
            backend = store.backend(),
            "Pipeline configured"
        );
        Ok(Self::new(
            source,
            valuer,
            ProfitabilityEngine::new(pricing),
            Reconciler::new(store),
            config.retention.clone(),
            &config.service.source_currency,
        ))
    }

    pub fn with_search(mut self, search: SearchParams) -> Self {
        self.search = search;
        self
    }

    pub fn engine(&self) -> &ProfitabilityEngine {
        &self.engine
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Acquire a batch, valuate and score it, and persist the scored records.
    pub async fn run_full_scrape(&self, cancel: &CancellationToken) -> Result<ScrapeSummary> {
        let acquisition = self.source.acquire(&self.search).await;
        let total_scraped = acquisition.listings.len();
        info!(total_scraped, synthetic = acquisition.synthetic, "Listings acquired");

        let pairs: Vec<(ListingRecord, VehicleQuery)> = acquisition
            .listings
            .into_iter()
            .map(|l| {
                let q = VehicleQuery::from(&l);
                (l, q)
            })
            .collect();
        let valued = self.valuer.batch_valuate(pairs, cancel).await;
        let with_valuation = valued
            .iter()
            .filter(|(_, v)| v.usable_value().is_some())
            .count();

        let now = Utc::now();
        let records: Vec<ArbitrageRecord> = valued
            .iter()
            .filter_map(|(listing, valuation)| match self.engine.evaluate(listing, valuation) {
                Some(result) => Some(ArbitrageRecord::from_scored(
                    listing,
                    valuation,
                    &result,
                    &self.source_currency,
                    now,
                )),
                None => {
                    debug!(listing = %listing, "Listing not scoreable, dropped");
                    None
                }
            })
            .collect();

        let attempted = records.len();
        let report = self.reconciler.upsert(records, cancel).await;
        if report.failed > 0 {
            return Err(ArbError::Storage(format!(
                "{} of {} record writes failed",
                report.failed, attempted
            ))
            .into());
        }

        let summary = ScrapeSummary {
            total_scraped,
            with_valuation,
            saved: report.saved(),
            inserted: report.inserted,
            updated: report.updated,
            failed_writes: report.failed,
            unwritten: report.skipped,
            synthetic: acquisition.synthetic,
            cancelled: cancel.is_cancelled(),
            timestamp: Utc::now(),
        };
        info!(%summary, "Full scrape complete");
        Ok(summary)
    }

    /// Re-valuate and re-score the oldest active records in place, one at a
    /// time with the configured delay between items.
    pub async fn refresh_existing(&self, cancel: &CancellationToken) -> Result<RefreshSummary> {
        let candidates = self
            .reconciler
            .refresh_candidates(self.retention.refresh_after(), self.retention.refresh_batch)
            .await?;
        let delay = Duration::from_millis(self.retention.refresh_delay_ms);

        let mut summary = RefreshSummary {
            candidates: candidates.len(),
            ..RefreshSummary::default()
        };

        for (i, mut record) in candidates.into_iter().enumerate() {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            if i > 0 && !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        summary.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let valuation = self.valuer.valuate(&VehicleQuery::from(&record)).await;
            let Some(result) = self.engine.evaluate(&record, &valuation) else {
                debug!(record = %record, "Record not scoreable, skipped");
                summary.skipped += 1;
                continue;
            };
            record.apply_score(&valuation, &result);

            let key = record.natural_key();
            let report = self.reconciler.upsert(vec![record], cancel).await;
            if report.skipped > 0 {
                summary.cancelled = true;
                break;
            }
            if report.failed > 0 {
                warn!(key = %key, "Refresh write failed, continuing");
                summary.failed += 1;
            } else {
                summary.refreshed += 1;
            }
        }

        summary.timestamp = Utc::now();
        info!(
            candidates = summary.candidates,
            refreshed = summary.refreshed,
            skipped = summary.skipped,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Refresh complete"
        );
        Ok(summary)
    }

    pub async fn cleanup(&self) -> Result<CleanupSummary> {
        self.reconciler.cleanup(&self.retention).await
    }
}
