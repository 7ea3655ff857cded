//! Reconciliation store: persistence identity and record lifecycle.
//!
//! Owns every lifecycle transition of an [`ArbitrageRecord`]: first insert,
//! in-place update under the natural key, soft retirement of stale records
//! and hard deletion of long-inactive ones.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RetentionConfig;
use crate::storage::{ListingStore, RecordFilter, RecordPatch, RecordQuery, RecordSort, UpsertOutcome};
use crate::types::{ArbitrageRecord, CleanupSummary};

/// Per-batch write counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    /// Never started because the batch was cancelled.
    pub skipped: usize,
}

impl UpsertReport {
    pub fn saved(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn ListingStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        &self.store
    }

    pub async fn upsert(&self, records: Vec<ArbitrageRecord>, cancel: &CancellationToken) -> UpsertReport {
        self.upsert_at(records, Utc::now(), cancel).await
    }

    /// Find-or-create each record by natural key. An existing record keeps
    /// its `id` and `created_at`; everything else is overwritten. Each item
    /// is written on its own, so one rejected write does not block the rest.
    /// Once `cancel` fires no further write is started; a write already in
    /// progress completes. The store is flushed once at the end of the pass.
    pub async fn upsert_at(
        &self,
        records: Vec<ArbitrageRecord>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> UpsertReport {
        let mut report = UpsertReport::default();
        let total = records.len();
        for (i, record) in records.into_iter().enumerate() {
            if cancel.is_cancelled() {
                report.skipped = total - i;
                info!(skipped = report.skipped, "Upsert cancelled, remaining writes not started");
                break;
            }
            let key = record.natural_key();
            match self.upsert_one(record, now).await {
                Ok(UpsertOutcome::Inserted) => report.inserted += 1,
                Ok(UpsertOutcome::Updated) => report.updated += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to persist record");
                    report.failed += 1;
                }
            }
        }

        if report.saved() > 0 {
            if let Err(e) = self.store.flush().await {
                warn!(pending = report.saved(), error = %e, "Failed to flush record writes");
                report.failed += report.saved();
                report.inserted = 0;
                report.updated = 0;
            }
        }

        debug!(
            inserted = report.inserted,
            updated = report.updated,
            failed = report.failed,
            skipped = report.skipped,
            "Upsert batch complete"
        );
        report
    }

    async fn upsert_one(&self, mut record: ArbitrageRecord, now: DateTime<Utc>) -> Result<UpsertOutcome> {
        if let Some(existing) = self.store.find_by_key(&record.natural_key()).await? {
            record.id = existing.id;
            record.created_at = existing.created_at;
        } else {
            record.created_at = now;
        }
        record.last_updated = now;
        record.is_active = true;
        self.store.upsert(record).await
    }

    /// Soft-retire active records not updated within `max_age`.
    pub async fn deactivate_stale(&self, max_age: Duration) -> Result<u64> {
        let cutoff = Utc::now() - max_age;
        let filter = RecordFilter::active().updated_before(cutoff);
        let n = self.store.update_many(&filter, &RecordPatch::deactivate()).await?;
        if n > 0 {
            info!(deactivated = n, %cutoff, "Deactivated stale records");
        }
        Ok(n)
    }

    /// Permanently remove inactive records not updated within `max_age`.
    pub async fn purge_expired(&self, max_age: Duration) -> Result<u64> {
        let cutoff = Utc::now() - max_age;
        let n = self.store.delete_many(&RecordFilter::inactive().updated_before(cutoff)).await?;
        if n > 0 {
            info!(purged = n, %cutoff, "Purged expired records");
        }
        Ok(n)
    }

    /// Up to `limit` active records last updated before `stale_after` ago,
    /// oldest first.
    pub async fn refresh_candidates(&self, stale_after: Duration, limit: usize) -> Result<Vec<ArbitrageRecord>> {
        let cutoff = Utc::now() - stale_after;
        let query = RecordQuery::new(RecordFilter::active().updated_before(cutoff))
            .sort(RecordSort::LastUpdatedAsc)
            .limit(limit);
        self.store.find(&query).await
    }

    /// Both retirement stages, soft first.
    pub async fn cleanup(&self, retention: &RetentionConfig) -> Result<CleanupSummary> {
        let deactivated = self.deactivate_stale(retention.stale_after()).await?;
        let purged = self.purge_expired(retention.purge_after()).await?;
        info!(deactivated, purged, "Cleanup complete");
        Ok(CleanupSummary { deactivated, purged })
    }
}
