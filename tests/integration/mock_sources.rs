//! Mock listing provider, valuation tier and store for integration testing.
//!
//! All are deterministic and in-memory. The provider and tier can be
//! switched into a failing mode from test code to exercise the fallback
//! paths; the store can be slowed down to hold a write open.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Datelike, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use carbitrage::engine::acquirer::ListingSource;
use carbitrage::engine::pipeline::Pipeline;
use carbitrage::engine::reconciler::Reconciler;
use carbitrage::engine::valuer::Valuer;
use carbitrage::config::{RetentionConfig, SourcesConfig};
use carbitrage::pricing::profitability::ProfitabilityEngine;
use carbitrage::pricing::SharedPricing;
use carbitrage::sources::synthetic::SyntheticListings;
use carbitrage::sources::ListingProvider;
use carbitrage::storage::json::JsonStore;
use carbitrage::storage::{ListingStore, RecordFilter, RecordPatch, RecordQuery, UpsertOutcome};
use carbitrage::types::*;
use carbitrage::valuation::synthetic::SyntheticValuation;
use carbitrage::valuation::ValuationTier;

/// The golden listing: 2,000,000 JPY, five years old, 40,000 km.
pub fn golden_listing() -> ListingRecord {
    ListingRecord {
        make: "Toyota".to_string(),
        model: "Prius".to_string(),
        year: Utc::now().year() - 5,
        mileage: Some(40_000),
        condition: Some("Good".to_string()),
        price: 2_000_000,
        source: "Goo-net".to_string(),
        url: "https://www.goo-net.com/usedcar/spread/goo/golden.html".to_string(),
        listed_at: Utc::now(),
        attributes: VehicleAttributes::default(),
    }
}

/// A provider that returns a fixed listing set, or fails on demand.
pub struct MockProvider {
    listings: Mutex<Vec<ListingRecord>>,
    force_error: Mutex<Option<String>>,
    pub calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(listings: Vec<ListingRecord>) -> Arc<Self> {
        Arc::new(Self {
            listings: Mutex::new(listings),
            force_error: Mutex::new(None),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn set_listings(&self, listings: Vec<ListingRecord>) {
        *self.listings.lock().unwrap() = listings;
    }
}

#[async_trait]
impl ListingProvider for MockProvider {
    fn name(&self) -> &str {
        "mock provider"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn fetch(&self, _params: &SearchParams) -> Result<Vec<ListingRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = self.force_error.lock().unwrap().clone() {
            return Err(anyhow!(msg));
        }
        Ok(self.listings.lock().unwrap().clone())
    }
}

/// A live-looking tier answering with a fixed average, or failing on demand.
pub struct MockTier {
    average: Decimal,
    force_error: Mutex<Option<String>>,
    pub calls: AtomicUsize,
}

impl MockTier {
    pub fn new(average: Decimal) -> Arc<Self> {
        Arc::new(Self {
            average,
            force_error: Mutex::new(None),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }
}

#[async_trait]
impl ValuationTier for MockTier {
    fn name(&self) -> &str {
        "mock tier"
    }

    fn is_live(&self) -> bool {
        true
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn try_fetch(&self, _query: &VehicleQuery) -> Result<Option<ValuationEstimate>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = self.force_error.lock().unwrap().clone() {
            return Err(anyhow!(msg));
        }
        Ok(Some(ValuationEstimate {
            low: None,
            high: None,
            average: Some(self.average),
            currency: "USD".to_string(),
            provenance: Provenance::RemoteApi,
            fetched_at: Utc::now(),
        }))
    }
}

/// Pipeline over the given mocks with default pricing and retention and
/// no courtesy delay.
pub fn build_pipeline(
    provider: Arc<MockProvider>,
    tier: Arc<MockTier>,
    store: Arc<dyn ListingStore>,
    pricing: SharedPricing,
) -> Pipeline {
    build_pipeline_with_providers(vec![provider], tier, store, pricing)
}

pub fn build_pipeline_with_providers(
    providers: Vec<Arc<MockProvider>>,
    tier: Arc<MockTier>,
    store: Arc<dyn ListingStore>,
    pricing: SharedPricing,
) -> Pipeline {
    let providers: Vec<Arc<dyn ListingProvider>> = providers
        .into_iter()
        .map(|p| p as Arc<dyn ListingProvider>)
        .collect();
    let tiers: Vec<Arc<dyn ValuationTier>> = vec![tier as Arc<dyn ValuationTier>];
    let source = ListingSource::new(
        providers,
        Arc::new(SyntheticListings::seeded(7, 30)),
        &SourcesConfig::default(),
    );
    let valuer = Valuer::new(tiers, Arc::new(SyntheticValuation::seeded(7)), Duration::ZERO, 2);
    let retention = RetentionConfig {
        refresh_delay_ms: 0,
        ..RetentionConfig::default()
    };
    Pipeline::new(
        source,
        valuer,
        ProfitabilityEngine::new(pricing),
        Reconciler::new(store),
        retention,
        "JPY",
    )
}

/// An in-memory store whose upserts each take `hold` to complete.
pub struct SlowStore {
    inner: JsonStore,
    hold: Duration,
    pub started: AtomicUsize,
}

impl SlowStore {
    pub fn new(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: JsonStore::in_memory(),
            hold,
            started: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ListingStore for SlowStore {
    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<ArbitrageRecord>> {
        self.inner.find_by_key(key).await
    }

    async fn upsert(&self, record: ArbitrageRecord) -> Result<UpsertOutcome> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.inner.upsert(record).await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    async fn find(&self, query: &RecordQuery) -> Result<Vec<ArbitrageRecord>> {
        self.inner.find(query).await
    }

    async fn update_many(&self, filter: &RecordFilter, patch: &RecordPatch) -> Result<u64> {
        self.inner.update_many(filter, patch).await
    }

    async fn delete_many(&self, filter: &RecordFilter) -> Result<u64> {
        self.inner.delete_many(filter).await
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64> {
        self.inner.count(filter).await
    }

    fn backend(&self) -> &'static str {
        "slow"
    }
}
