//! Full-scrape and refresh flows through the real engine.

use rust_decimal_macros::dec;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use carbitrage::config::{StorageBackend, StorageConfig};
use carbitrage::pricing::{ExchangeRates, SharedPricing};
use carbitrage::storage::json::JsonStore;
use carbitrage::storage::{self, ListingStore, RecordFilter, RecordQuery};
use carbitrage::types::*;

use crate::mock_sources::{build_pipeline, build_pipeline_with_providers, golden_listing, MockProvider, MockTier};

async fn all_records(store: &Arc<dyn ListingStore>) -> Vec<ArbitrageRecord> {
    store.find(&RecordQuery::new(RecordFilter::default())).await.unwrap()
}

#[tokio::test]
async fn test_golden_scenario_persists_exact_values() {
    let store: Arc<dyn ListingStore> = Arc::new(JsonStore::in_memory());
    let pipeline = build_pipeline(
        MockProvider::new(vec![golden_listing()]),
        MockTier::new(dec!(20000)),
        store.clone(),
        SharedPricing::default(),
    );

    let summary = pipeline.run_full_scrape(&CancellationToken::new()).await.unwrap();
    assert!(!summary.synthetic);
    assert_eq!(summary.total_scraped, 1);
    assert_eq!(summary.with_valuation, 1);
    assert_eq!(summary.inserted, 1);

    let records = all_records(&store).await;
    assert_eq!(records.len(), 1);
    let r = &records[0];
    assert_eq!(r.source_price, 2_000_000);
    assert_eq!(r.source_currency, "JPY");
    assert_eq!(r.resale_value, Some(dec!(20000)));
    assert_eq!(r.total_cost, Some(dec!(22030.5)));
    assert_eq!(r.estimated_profit, Some(dec!(-2030.5)));
    assert_eq!(r.profitability_score, Some(10));
    assert_eq!(r.risk, Some(RiskTier::VeryHigh));
    assert!(!r.recommended);
    assert_eq!(r.valuation_source, Provenance::RemoteApi.tag());
    assert!(r.is_active);
}

#[tokio::test]
async fn test_rescrape_updates_in_place() {
    let store: Arc<dyn ListingStore> = Arc::new(JsonStore::in_memory());
    let pipeline = build_pipeline(
        MockProvider::new(vec![golden_listing()]),
        MockTier::new(dec!(20000)),
        store.clone(),
        SharedPricing::default(),
    );
    let cancel = CancellationToken::new();

    pipeline.run_full_scrape(&cancel).await.unwrap();
    let first = all_records(&store).await.remove(0);

    let again = pipeline.run_full_scrape(&cancel).await.unwrap();
    assert_eq!(again.inserted, 0);
    assert_eq!(again.updated, 1);

    let records = all_records(&store).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, first.id);
    assert_eq!(records[0].created_at, first.created_at);
    assert!(records[0].last_updated >= first.last_updated);
}

#[tokio::test]
async fn test_listing_seen_by_two_providers_is_valued_once() {
    let store: Arc<dyn ListingStore> = Arc::new(JsonStore::in_memory());
    let first = MockProvider::new(vec![golden_listing()]);
    let second = MockProvider::new(vec![golden_listing()]);
    let tier = MockTier::new(dec!(20000));
    let pipeline = build_pipeline_with_providers(
        vec![first.clone(), second.clone()],
        tier.clone(),
        store.clone(),
        SharedPricing::default(),
    );

    let summary = pipeline.run_full_scrape(&CancellationToken::new()).await.unwrap();
    assert_eq!(first.calls.load(Ordering::SeqCst), 1);
    assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    assert_eq!(summary.total_scraped, 1);
    assert_eq!(tier.calls.load(Ordering::SeqCst), 1);
    assert_eq!(summary.inserted, 1);
    assert_eq!(all_records(&store).await.len(), 1);
}

#[tokio::test]
async fn test_provider_failure_falls_back_to_synthetic() {
    let store: Arc<dyn ListingStore> = Arc::new(JsonStore::in_memory());
    let provider = MockProvider::new(vec![golden_listing()]);
    provider.set_error("503 Service Unavailable");
    let pipeline = build_pipeline(provider, MockTier::new(dec!(20000)), store.clone(), SharedPricing::default());

    let summary = pipeline.run_full_scrape(&CancellationToken::new()).await.unwrap();
    assert!(summary.synthetic);
    assert_eq!(summary.total_scraped, 25);
    assert!(all_records(&store).await.iter().all(|r| r.source_name.starts_with("Mock ")));
}

#[tokio::test]
async fn test_tier_failure_cascades_to_synthetic_valuation() {
    let store: Arc<dyn ListingStore> = Arc::new(JsonStore::in_memory());
    let tier = MockTier::new(dec!(20000));
    tier.set_error("connection reset");
    let pipeline = build_pipeline(
        MockProvider::new(vec![golden_listing()]),
        tier,
        store.clone(),
        SharedPricing::default(),
    );

    let summary = pipeline.run_full_scrape(&CancellationToken::new()).await.unwrap();
    assert_eq!(summary.saved, 1);
    let r = all_records(&store).await.remove(0);
    assert_eq!(r.valuation_source, Provenance::CuratedTable.tag());
    // Five-year-old Prius from the curated table: 20000 × 0.75.
    assert_eq!(r.resale_value, Some(dec!(15000)));
}

#[tokio::test]
async fn test_unpriced_listing_is_dropped_not_fatal() {
    let store: Arc<dyn ListingStore> = Arc::new(JsonStore::in_memory());
    let mut free = golden_listing();
    free.price = 0;
    free.url = "https://www.goo-net.com/usedcar/spread/goo/free.html".to_string();
    let pipeline = build_pipeline(
        MockProvider::new(vec![free, golden_listing()]),
        MockTier::new(dec!(20000)),
        store.clone(),
        SharedPricing::default(),
    );

    let summary = pipeline.run_full_scrape(&CancellationToken::new()).await.unwrap();
    assert_eq!(summary.total_scraped, 2);
    assert_eq!(summary.saved, 1);
}

#[tokio::test]
async fn test_rate_update_reaches_next_run() {
    let store: Arc<dyn ListingStore> = Arc::new(JsonStore::in_memory());
    let pricing = SharedPricing::default();
    let provider = MockProvider::new(vec![golden_listing()]);
    let pipeline = build_pipeline(provider.clone(), MockTier::new(dec!(20000)), store.clone(), pricing.clone());
    let cancel = CancellationToken::new();

    pipeline.run_full_scrape(&cancel).await.unwrap();

    // 100 JPY per USD: the same car now costs 20,000 USD before fees.
    pricing.set_rates(ExchangeRates::from_quote(dec!(100)).unwrap()).unwrap();
    let mut repriced = golden_listing();
    repriced.url = "https://www.goo-net.com/usedcar/spread/goo/repriced.html".to_string();
    provider.set_listings(vec![repriced]);
    pipeline.run_full_scrape(&cancel).await.unwrap();

    let records = all_records(&store).await;
    let old = records.iter().find(|r| r.source_url.ends_with("golden.html")).unwrap();
    let new = records.iter().find(|r| r.source_url.ends_with("repriced.html")).unwrap();
    assert!(new.estimated_profit.unwrap() < old.estimated_profit.unwrap());
    assert!(new.total_cost.unwrap() > dec!(20000));
}

#[tokio::test]
async fn test_sqlite_backend_end_to_end() {
    let config = StorageConfig {
        backend: StorageBackend::Sqlite,
        sqlite_url: "sqlite::memory:".to_string(),
        ..StorageConfig::default()
    };
    let (store, audit) = storage::open(&config).await.unwrap();
    let pipeline = build_pipeline(
        MockProvider::new(vec![golden_listing()]),
        MockTier::new(dec!(20000)),
        store.clone(),
        SharedPricing::default(),
    );
    let cancel = CancellationToken::new();

    pipeline.run_full_scrape(&cancel).await.unwrap();
    let second = pipeline.run_full_scrape(&cancel).await.unwrap();
    assert_eq!(second.updated, 1);
    assert_eq!(store.count(&RecordFilter::default()).await.unwrap(), 1);

    let record = JobExecutionRecord::success("daily_full_scrape", serde_json::to_value(&second).unwrap());
    audit.append(&record).await.unwrap();
    let log = audit.recent(Some("daily_full_scrape"), 5).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].payload["updated"], 1);
}

#[tokio::test]
async fn test_refresh_then_cleanup_lifecycle() {
    let store: Arc<dyn ListingStore> = Arc::new(JsonStore::in_memory());
    let pipeline = build_pipeline(
        MockProvider::new(vec![golden_listing()]),
        MockTier::new(dec!(20000)),
        store.clone(),
        SharedPricing::default(),
    );
    let cancel = CancellationToken::new();
    pipeline.run_full_scrape(&cancel).await.unwrap();

    // Nothing is old enough to refresh or retire yet.
    let refresh = pipeline.refresh_existing(&cancel).await.unwrap();
    assert_eq!(refresh.candidates, 0);
    let cleanup = pipeline.cleanup().await.unwrap();
    assert_eq!(cleanup, CleanupSummary::default());
    assert_eq!(store.count(&RecordFilter::active()).await.unwrap(), 1);
}
