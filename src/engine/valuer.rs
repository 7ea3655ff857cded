//! Valuation provider: the tier cascade and batch enrichment.
//!
//! Tiers are tried in order, each under its own timeout; an error, a
//! timeout, and "no data" all fall through to the next tier. The synthetic
//! tier always answers, so [`Valuer::valuate`] never fails and never
//! blocks the pipeline. Batch enrichment runs up to `max_concurrency`
//! items at once and, when live tiers are configured, spaces item starts
//! through a shared [`Throttle`].

use anyhow::Result;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::throttle::Throttle;
use crate::config::ValuationConfig;
use crate::valuation::classic_api::ClassicApiTier;
use crate::valuation::classic_web::ClassicWebTier;
use crate::valuation::synthetic::SyntheticValuation;
use crate::valuation::ValuationTier;
use crate::types::{ValuationEstimate, VehicleQuery};

pub struct Valuer {
    tiers: Vec<Arc<dyn ValuationTier>>,
    fallback: Arc<SyntheticValuation>,
    throttle: Throttle,
    max_concurrency: usize,
}

impl Valuer {
    pub fn new(
        tiers: Vec<Arc<dyn ValuationTier>>,
        fallback: Arc<SyntheticValuation>,
        courtesy_delay: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            tiers,
            fallback,
            throttle: Throttle::new(courtesy_delay),
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Build the enabled tiers from config. `synthetic_only` leaves just
    /// the synthetic fallback.
    pub fn from_config(config: &ValuationConfig, synthetic_only: bool) -> Result<Self> {
        let mut tiers: Vec<Arc<dyn ValuationTier>> = Vec::new();
        if !synthetic_only {
            if config.api.enabled {
                tiers.push(Arc::new(ClassicApiTier::new(&config.api)?));
            }
            if config.web.enabled {
                tiers.push(Arc::new(ClassicWebTier::new(&config.web)?));
            }
        }
        Ok(Self::new(
            tiers,
            Arc::new(SyntheticValuation::new()),
            Duration::from_millis(config.courtesy_delay_ms),
            config.max_concurrency,
        ))
    }

    pub fn has_live_tiers(&self) -> bool {
        self.tiers.iter().any(|t| t.is_live())
    }

    /// Walk the cascade for one vehicle.
    pub async fn valuate(&self, query: &VehicleQuery) -> ValuationEstimate {
        for tier in &self.tiers {
            match timeout(tier.timeout(), tier.try_fetch(query)).await {
                Ok(Ok(Some(estimate))) if estimate.usable_value().is_some() => {
                    debug!(vehicle = %query.search_text(), tier = tier.name(), "Valuation found");
                    return estimate;
                }
                Ok(Ok(_)) => {
                    debug!(vehicle = %query.search_text(), tier = tier.name(), "No data, trying next tier");
                }
                Ok(Err(e)) => {
                    warn!(vehicle = %query.search_text(), tier = tier.name(), error = %e, "Valuation tier failed");
                }
                Err(_) => {
                    warn!(vehicle = %query.search_text(), tier = tier.name(), "Valuation tier timed out");
                }
            }
        }
        self.fallback.estimate(query)
    }

    /// Valuate a batch of `(item, query)` pairs, preserving input order.
    /// Items not yet started when `cancel` fires are left out of the result.
    pub async fn batch_valuate<T: Send>(
        &self,
        items: Vec<(T, VehicleQuery)>,
        cancel: &CancellationToken,
    ) -> Vec<(T, ValuationEstimate)> {
        let total = items.len();
        let throttled = self.has_live_tiers();

        let results: Vec<(T, ValuationEstimate)> = stream::iter(items)
            .map(|(item, query)| async move {
                if cancel.is_cancelled() {
                    return None;
                }
                if throttled {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = self.throttle.acquire() => {}
                    }
                }
                let estimate = self.valuate(&query).await;
                Some((item, estimate))
            })
            .buffered(self.max_concurrency)
            .filter_map(|r| async move { r })
            .collect()
            .await;

        info!(
            total,
            valued = results.len(),
            throttled,
            cancelled = cancel.is_cancelled(),
            "Batch valuation complete"
        );
        results
    }
}
