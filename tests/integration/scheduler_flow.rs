//! Scheduler driving the real pipeline jobs on a paused clock.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use carbitrage::pricing::SharedPricing;
use carbitrage::scheduler::jobs::{CleanupJob, FullScrapeJob, RefreshJob, CLEANUP, EXCHANGE_RATE, FULL_SCRAPE, REFRESH};
use carbitrage::scheduler::{JobState, ScheduledJob, Scheduler, TriggerOutcome};
use carbitrage::storage::json::{JsonAuditLog, JsonStore};
use carbitrage::storage::{AuditLog, ListingStore, RecordFilter};
use carbitrage::types::JobStatus;

use crate::mock_sources::{build_pipeline, golden_listing, MockProvider, MockTier, SlowStore};

/// Stands in for the exchange-rate job with an endpoint that always fails.
struct BrokenRateJob {
    calls: AtomicUsize,
}

#[async_trait]
impl ScheduledJob for BrokenRateJob {
    fn name(&self) -> &str {
        EXCHANGE_RATE
    }

    async fn run(&self, _cancel: &CancellationToken) -> Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("Exchange-rate API error: 500 Internal Server Error")
    }
}

fn build_scheduler(
    store: Arc<dyn ListingStore>,
    audit: Arc<JsonAuditLog>,
    rate_job: Arc<BrokenRateJob>,
) -> Scheduler {
    let pipeline = Arc::new(build_pipeline(
        MockProvider::new(vec![golden_listing()]),
        MockTier::new(dec!(20000)),
        store,
        SharedPricing::default(),
    ));
    let mut scheduler = Scheduler::new(audit, CancellationToken::new());
    scheduler.register(Arc::new(FullScrapeJob::new(pipeline.clone())), Duration::from_secs(24 * 3600));
    scheduler.register(Arc::new(RefreshJob::new(pipeline.clone())), Duration::from_secs(4 * 3600));
    scheduler.register(rate_job, Duration::from_secs(3600));
    scheduler.register(Arc::new(CleanupJob::new(pipeline)), Duration::from_secs(7 * 24 * 3600));
    scheduler
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_failing_rate_job_does_not_stop_the_others() {
    let store: Arc<dyn ListingStore> = Arc::new(JsonStore::in_memory());
    let audit = Arc::new(JsonAuditLog::in_memory());
    let rate_job = Arc::new(BrokenRateJob {
        calls: AtomicUsize::new(0),
    });
    let scheduler = build_scheduler(store.clone(), audit.clone(), rate_job.clone());
    scheduler.start_all();

    // One hour: only the rate job is due.
    tokio::time::sleep(Duration::from_secs(3600 + 1)).await;
    settle().await;
    let log = audit.recent(None, 100).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].job_name, EXCHANGE_RATE);
    assert_eq!(log[0].status, JobStatus::Error);

    // Four hours: the refresh has run despite three rate failures.
    tokio::time::sleep(Duration::from_secs(3 * 3600)).await;
    settle().await;
    assert_eq!(rate_job.calls.load(Ordering::SeqCst), 4);
    let refreshes = audit.recent(Some(REFRESH), 10).await.unwrap();
    assert_eq!(refreshes.len(), 1);
    assert_eq!(refreshes[0].status, JobStatus::Success);

    // One day: the full scrape has persisted the golden listing.
    tokio::time::sleep(Duration::from_secs(20 * 3600)).await;
    settle().await;
    let scrapes = audit.recent(Some(FULL_SCRAPE), 10).await.unwrap();
    assert_eq!(scrapes.len(), 1);
    assert_eq!(scrapes[0].status, JobStatus::Success);
    assert_eq!(scrapes[0].payload["saved"], 1);
    assert_eq!(store.count(&RecordFilter::active()).await.unwrap(), 1);

    let errors = audit
        .recent(None, 100)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.status == JobStatus::Error)
        .count();
    assert_eq!(errors, rate_job.calls.load(Ordering::SeqCst));

    let status = scheduler.status();
    assert!(status.iter().all(|s| s.state != JobState::Stopped));
    assert_eq!(status.iter().find(|s| s.name == CLEANUP).unwrap().runs, 0);

    scheduler.stop_all_jobs();
    assert!(scheduler.status().iter().all(|s| s.state == JobState::Stopped));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_mid_write_finishes_that_write_only() {
    let store = SlowStore::new(Duration::from_secs(10));
    let listings = (0..3)
        .map(|i| {
            let mut l = golden_listing();
            l.url = format!("https://www.goo-net.com/usedcar/spread/goo/{i}.html");
            l
        })
        .collect();
    let pipeline = Arc::new(build_pipeline(
        MockProvider::new(listings),
        MockTier::new(dec!(20000)),
        store.clone(),
        SharedPricing::default(),
    ));
    let audit = Arc::new(JsonAuditLog::in_memory());
    let mut scheduler = Scheduler::new(audit.clone(), CancellationToken::new());
    scheduler.register(Arc::new(FullScrapeJob::new(pipeline)), Duration::from_secs(24 * 3600));

    assert_eq!(scheduler.trigger(FULL_SCRAPE).unwrap(), TriggerOutcome::Started);
    // Into the first write, which holds for ten seconds.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(store.started.load(Ordering::SeqCst), 1);

    assert!(scheduler.shutdown(Duration::from_secs(60)).await);

    assert_eq!(store.started.load(Ordering::SeqCst), 1);
    assert_eq!(store.count(&RecordFilter::active()).await.unwrap(), 1);
    let log = audit.recent(Some(FULL_SCRAPE), 10).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, JobStatus::Success);
    assert_eq!(log[0].payload["saved"], 1);
    assert_eq!(log[0].payload["unwritten"], 2);
    assert_eq!(log[0].payload["cancelled"], true);
}

#[test]
fn test_run_once_outside_async_context() {
    let store: Arc<dyn ListingStore> = Arc::new(JsonStore::in_memory());
    let audit = Arc::new(JsonAuditLog::in_memory());
    let rate_job = Arc::new(BrokenRateJob {
        calls: AtomicUsize::new(0),
    });
    let scheduler = build_scheduler(store, audit, rate_job);

    let record = tokio_test::block_on(scheduler.run_once(CLEANUP)).unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Success);
    assert_eq!(record.payload["deactivated"], 0);
    assert_eq!(record.payload["purged"], 0);

    let unknown = tokio_test::block_on(scheduler.run_once("weekly_report"));
    assert!(unknown.is_err());
}
