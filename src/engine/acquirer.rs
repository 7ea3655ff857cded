//! Listing source aggregator.
//!
//! Queries every registered live provider concurrently, each under its own
//! timeout. A provider that errors or times out counts as zero records. If
//! the union is empty the synthetic generator fills in, so a call always
//! returns a non-empty batch. The union is deduplicated on natural key,
//! first occurrence wins.

use anyhow::Result;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::SourcesConfig;
use crate::sources::goonet::GooNetProvider;
use crate::sources::synthetic::SyntheticListings;
use crate::sources::uss::UssAuctionProvider;
use crate::sources::ListingProvider;
use crate::types::{ListingRecord, SearchParams};

/// One acquired batch.
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub listings: Vec<ListingRecord>,
    /// Whether the batch came from the synthetic generator.
    pub synthetic: bool,
}

pub struct ListingSource {
    providers: Vec<Arc<dyn ListingProvider>>,
    synthetic: Arc<SyntheticListings>,
    synthetic_only: bool,
    synthetic_count: usize,
    fallback_count: usize,
}

impl ListingSource {
    pub fn new(
        providers: Vec<Arc<dyn ListingProvider>>,
        synthetic: Arc<SyntheticListings>,
        config: &SourcesConfig,
    ) -> Self {
        Self {
            providers,
            synthetic,
            synthetic_only: config.synthetic_only,
            synthetic_count: config.synthetic_count.max(1),
            fallback_count: config.fallback_count.max(1),
        }
    }

    /// Build the enabled live providers from config.
    pub fn from_config(config: &SourcesConfig) -> Result<Self> {
        let mut providers: Vec<Arc<dyn ListingProvider>> = Vec::new();
        if !config.synthetic_only {
            if config.goonet.enabled {
                providers.push(Arc::new(GooNetProvider::new(&config.goonet)?));
            }
            if config.uss.enabled {
                providers.push(Arc::new(UssAuctionProvider::new(&config.uss)?));
            }
        }
        let synthetic = Arc::new(SyntheticListings::new(config.synthetic_count));
        Ok(Self::new(providers, synthetic, config))
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub async fn acquire(&self, params: &SearchParams) -> Acquisition {
        if self.synthetic_only || self.providers.is_empty() {
            info!(count = self.synthetic_count, "Synthetic-only mode, generating listings");
            return Acquisition {
                listings: self.synthetic.generate(self.synthetic_count),
                synthetic: true,
            };
        }

        let fetches = self.providers.iter().map(|provider| async move {
            let outcome = timeout(provider.timeout(), provider.fetch(params)).await;
            match outcome {
                Ok(Ok(listings)) => listings,
                Ok(Err(e)) => {
                    warn!(provider = provider.name(), error = %e, "Provider failed, continuing without");
                    Vec::new()
                }
                Err(_) => {
                    warn!(
                        provider = provider.name(),
                        timeout_secs = provider.timeout().as_secs(),
                        "Provider timed out, continuing without"
                    );
                    Vec::new()
                }
            }
        });

        let fetched: Vec<ListingRecord> = join_all(fetches).await.into_iter().flatten().collect();
        let listings = dedupe(fetched);

        if listings.is_empty() {
            warn!(
                count = self.fallback_count,
                "No live listings obtained, falling back to synthetic data"
            );
            return Acquisition {
                listings: self.synthetic.generate(self.fallback_count),
                synthetic: true,
            };
        }

        info!(count = listings.len(), "Live listings acquired");
        Acquisition {
            listings,
            synthetic: false,
        }
    }
}

/// Keep the first listing per natural key, preserving order.
fn dedupe(listings: Vec<ListingRecord>) -> Vec<ListingRecord> {
    let before = listings.len();
    let mut seen = HashSet::with_capacity(before);
    let unique: Vec<ListingRecord> = listings
        .into_iter()
        .filter(|l| seen.insert(l.natural_key()))
        .collect();
    if unique.len() < before {
        debug!(duplicates = before - unique.len(), "Dropped duplicate listings");
    }
    unique
}
