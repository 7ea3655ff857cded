//! Persistence layer.
//!
//! The pipeline depends only on the narrow [`ListingStore`] contract
//! (find by key, upsert + flush, filtered find, bulk update/delete, count) and the
//! append-only [`AuditLog`]. Two backends implement both: a JSON document
//! file (or pure in-memory store for tests) and SQLite via `sqlx`.

pub mod json;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::info;

use crate::config::{StorageBackend, StorageConfig};
use crate::types::{ArbitrageRecord, JobExecutionRecord, NaturalKey};

// ---------------------------------------------------------------------------
// Query vocabulary
// ---------------------------------------------------------------------------

/// Whether an upsert created a new record or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Conjunctive record filter. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub is_active: Option<bool>,
    /// Strictly older than this `last_updated`.
    pub updated_before: Option<DateTime<Utc>>,
    /// Case-insensitive make match.
    pub make: Option<String>,
    /// Only records with score and profit jointly present.
    pub scored_only: bool,
    pub min_score: Option<u8>,
    pub recommended_only: bool,
}

impl RecordFilter {
    pub fn active() -> Self {
        Self {
            is_active: Some(true),
            ..Self::default()
        }
    }

    pub fn inactive() -> Self {
        Self {
            is_active: Some(false),
            ..Self::default()
        }
    }

    pub fn updated_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.updated_before = Some(cutoff);
        self
    }

    pub fn scored(mut self) -> Self {
        self.scored_only = true;
        self
    }

    pub fn min_score(mut self, score: u8) -> Self {
        self.scored_only = true;
        self.min_score = Some(score);
        self
    }

    pub fn matches(&self, r: &ArbitrageRecord) -> bool {
        if let Some(active) = self.is_active {
            if r.is_active != active {
                return false;
            }
        }
        if let Some(cutoff) = self.updated_before {
            if r.last_updated >= cutoff {
                return false;
            }
        }
        if let Some(make) = &self.make {
            if !r.make.eq_ignore_ascii_case(make) {
                return false;
            }
        }
        if self.scored_only && !r.is_scored() {
            return false;
        }
        if let Some(min) = self.min_score {
            if r.profitability_score.map_or(true, |s| s < min) {
                return false;
            }
        }
        if self.recommended_only && !r.recommended {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSort {
    LastUpdatedAsc,
    LastUpdatedDesc,
    ScoreDesc,
    ProfitDesc,
}

impl RecordSort {
    /// Profitability-ranked orderings exclude malformed (unscored) records.
    pub fn requires_scored(self) -> bool {
        matches!(self, RecordSort::ScoreDesc | RecordSort::ProfitDesc)
    }

    pub fn compare(self, a: &ArbitrageRecord, b: &ArbitrageRecord) -> Ordering {
        match self {
            RecordSort::LastUpdatedAsc => a.last_updated.cmp(&b.last_updated),
            RecordSort::LastUpdatedDesc => b.last_updated.cmp(&a.last_updated),
            RecordSort::ScoreDesc => b.profitability_score.cmp(&a.profitability_score),
            RecordSort::ProfitDesc => b.estimated_profit.cmp(&a.estimated_profit),
        }
    }
}

/// Filter + sort + pagination.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub filter: RecordFilter,
    pub sort: Option<RecordSort>,
    pub limit: Option<usize>,
    pub skip: usize,
}

impl RecordQuery {
    pub fn new(filter: RecordFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn sort(mut self, sort: RecordSort) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// The filter actually applied, tightened for ranked sorts.
    pub fn effective_filter(&self) -> RecordFilter {
        let mut filter = self.filter.clone();
        if self.sort.is_some_and(RecordSort::requires_scored) {
            filter.scored_only = true;
        }
        filter
    }

    /// Evaluate this query over an in-memory slice.
    pub fn apply<'a>(&self, records: impl IntoIterator<Item = &'a ArbitrageRecord>) -> Vec<ArbitrageRecord> {
        let filter = self.effective_filter();
        let mut out: Vec<ArbitrageRecord> = records
            .into_iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        if let Some(sort) = self.sort {
            out.sort_by(|a, b| sort.compare(a, b));
        }
        out.into_iter()
            .skip(self.skip)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Fields a bulk update may change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub is_active: Option<bool>,
}

impl RecordPatch {
    pub fn deactivate() -> Self {
        Self {
            is_active: Some(false),
        }
    }

    pub fn apply(&self, r: &mut ArbitrageRecord) {
        if let Some(active) = self.is_active {
            r.is_active = active;
        }
    }
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// Storage collaborator for arbitrage records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<ArbitrageRecord>>;

    /// Insert or replace the record sharing this record's natural key.
    /// Backends may defer durability until [`ListingStore::flush`].
    async fn upsert(&self, record: ArbitrageRecord) -> Result<UpsertOutcome>;

    /// Make every preceding upsert durable. Write-through backends have
    /// nothing to do.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn find(&self, query: &RecordQuery) -> Result<Vec<ArbitrageRecord>>;

    /// Returns the number of records modified.
    async fn update_many(&self, filter: &RecordFilter, patch: &RecordPatch) -> Result<u64>;

    /// Returns the number of records removed.
    async fn delete_many(&self, filter: &RecordFilter) -> Result<u64>;

    async fn count(&self, filter: &RecordFilter) -> Result<u64>;

    fn backend(&self) -> &'static str;
}

/// Append-only job execution log.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, record: &JobExecutionRecord) -> Result<()>;

    /// Newest first, optionally restricted to one job.
    async fn recent(&self, job_name: Option<&str>, limit: usize) -> Result<Vec<JobExecutionRecord>>;
}

/// Open the configured backend.
pub async fn open(config: &StorageConfig) -> Result<(Arc<dyn ListingStore>, Arc<dyn AuditLog>)> {
    match config.backend {
        StorageBackend::Json => {
            let store: Arc<dyn ListingStore> = Arc::new(json::JsonStore::open(&config.path)?);
            let audit: Arc<dyn AuditLog> = Arc::new(json::JsonAuditLog::open(&config.audit_path)?);
            info!(path = %config.path, audit = %config.audit_path, "Using JSON storage");
            Ok((store, audit))
        }
        StorageBackend::Sqlite => {
            let db = sqlite::SqliteStore::connect(&config.sqlite_url).await?;
            info!(url = %config.sqlite_url, "Using SQLite storage");
            let db = Arc::new(db);
            let store: Arc<dyn ListingStore> = db.clone();
            let audit: Arc<dyn AuditLog> = db;
            Ok((store, audit))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
