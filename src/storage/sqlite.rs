//! SQLite backend via `sqlx`.
//!
//! Each record is stored as a JSON document in `data`, with the fields the
//! pipeline filters and sorts on lifted into indexed columns. The columns
//! are authoritative for `is_active` and `last_updated` on read, so bulk
//! updates only touch the columns. The natural key carries a UNIQUE
//! constraint.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::str::FromStr;
use tracing::{debug, info};

use super::{
    AuditLog, ListingStore, RecordFilter, RecordPatch, RecordQuery, RecordSort, UpsertOutcome,
};
use crate::types::{ArbError, ArbitrageRecord, JobExecutionRecord, JobStatus, NaturalKey};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS arbitrage_records (
        id                  TEXT PRIMARY KEY,
        make                TEXT NOT NULL,
        model               TEXT NOT NULL,
        year                INTEGER NOT NULL,
        source_price        INTEGER NOT NULL,
        source_url          TEXT NOT NULL,
        is_active           INTEGER NOT NULL,
        profitability_score INTEGER,
        estimated_profit    REAL,
        recommended         INTEGER NOT NULL,
        last_updated        INTEGER NOT NULL,
        created_at          INTEGER NOT NULL,
        data                TEXT NOT NULL,
        UNIQUE (make, model, year, source_price, source_url)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_records_active_updated ON arbitrage_records (is_active, last_updated)",
    "CREATE INDEX IF NOT EXISTS idx_records_score ON arbitrage_records (profitability_score)",
    r#"
    CREATE TABLE IF NOT EXISTS job_executions (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        job_name    TEXT NOT NULL,
        status      TEXT NOT NULL,
        payload     TEXT NOT NULL,
        executed_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_job_executions_name ON job_executions (job_name, id)",
];

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| ArbError::Storage(format!("timestamp out of range: {ms}")).into())
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect (creating the database file if needed) and apply the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid SQLite URL: {url}"))?
            .create_if_missing(true);

        let in_memory = url.contains(":memory:");
        if !in_memory {
            if let Some(parent) = options.get_filename().parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create database directory {}", parent.display())
                    })?;
                }
            }
        }

        // An in-memory database exists per connection; pin it to one.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to connect to {url}"))?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url, "SQLite storage ready");
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to apply SQLite schema")?;
        }
        Ok(())
    }

    fn decode_record(row: &SqliteRow) -> Result<ArbitrageRecord> {
        let data: String = row.try_get("data")?;
        let mut record: ArbitrageRecord =
            serde_json::from_str(&data).context("Corrupt record document")?;
        record.is_active = row.try_get("is_active")?;
        record.last_updated = from_millis(row.try_get("last_updated")?)?;
        Ok(record)
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &RecordFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(active) = filter.is_active {
        qb.push(" AND is_active = ").push_bind(active);
    }
    if let Some(cutoff) = filter.updated_before {
        qb.push(" AND last_updated < ").push_bind(cutoff.timestamp_millis());
    }
    if let Some(make) = &filter.make {
        qb.push(" AND make = ")
            .push_bind(make.clone())
            .push(" COLLATE NOCASE");
    }
    if filter.scored_only {
        qb.push(" AND profitability_score IS NOT NULL AND estimated_profit IS NOT NULL");
    }
    if let Some(min) = filter.min_score {
        qb.push(" AND profitability_score >= ").push_bind(min as i64);
    }
    if filter.recommended_only {
        qb.push(" AND recommended = 1");
    }
}

#[async_trait]
impl ListingStore for SqliteStore {
    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<ArbitrageRecord>> {
        let row = sqlx::query(
            r#"
            SELECT data, is_active, last_updated FROM arbitrage_records
            WHERE make = ? AND model = ? AND year = ? AND source_price = ? AND source_url = ?
            "#,
        )
        .bind(key.make.as_str())
        .bind(key.model.as_str())
        .bind(key.year)
        .bind(key.source_price)
        .bind(key.source_url.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("find_by_key query failed")?;

        row.as_ref().map(Self::decode_record).transpose()
    }

    async fn upsert(&self, record: ArbitrageRecord) -> Result<UpsertOutcome> {
        let data = serde_json::to_string(&record).context("Failed to serialise record")?;
        let score = record.profitability_score.map(i64::from);
        let profit = record.estimated_profit.and_then(|p| p.to_f64());

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let existing: Option<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM arbitrage_records
            WHERE make = ? AND model = ? AND year = ? AND source_price = ? AND source_url = ?
            "#,
        )
        .bind(record.make.as_str())
        .bind(record.model.as_str())
        .bind(record.year)
        .bind(record.source_price)
        .bind(record.source_url.as_str())
        .fetch_optional(&mut *tx)
        .await
        .context("Natural-key lookup failed")?;

        let outcome = match existing {
            Some(old_id) => {
                sqlx::query(
                    r#"
                    UPDATE arbitrage_records
                    SET id = ?, is_active = ?, profitability_score = ?, estimated_profit = ?,
                        recommended = ?, last_updated = ?, created_at = ?, data = ?
                    WHERE id = ?
                    "#,
                )
                .bind(record.id.to_string())
                .bind(record.is_active)
                .bind(score)
                .bind(profit)
                .bind(record.recommended)
                .bind(record.last_updated.timestamp_millis())
                .bind(record.created_at.timestamp_millis())
                .bind(data.as_str())
                .bind(old_id)
                .execute(&mut *tx)
                .await
                .context("Record update failed")?;
                UpsertOutcome::Updated
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO arbitrage_records
                        (id, make, model, year, source_price, source_url, is_active,
                         profitability_score, estimated_profit, recommended,
                         last_updated, created_at, data)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(record.id.to_string())
                .bind(record.make.as_str())
                .bind(record.model.as_str())
                .bind(record.year)
                .bind(record.source_price)
                .bind(record.source_url.as_str())
                .bind(record.is_active)
                .bind(score)
                .bind(profit)
                .bind(record.recommended)
                .bind(record.last_updated.timestamp_millis())
                .bind(record.created_at.timestamp_millis())
                .bind(data.as_str())
                .execute(&mut *tx)
                .await
                .context("Record insert failed")?;
                UpsertOutcome::Inserted
            }
        };

        tx.commit().await.context("Failed to commit upsert")?;
        debug!(key = %record.natural_key(), ?outcome, "Record upserted");
        Ok(outcome)
    }

    async fn find(&self, query: &RecordQuery) -> Result<Vec<ArbitrageRecord>> {
        let filter = query.effective_filter();
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT data, is_active, last_updated FROM arbitrage_records");
        push_filter(&mut qb, &filter);

        if let Some(sort) = query.sort {
            qb.push(match sort {
                RecordSort::LastUpdatedAsc => " ORDER BY last_updated ASC",
                RecordSort::LastUpdatedDesc => " ORDER BY last_updated DESC",
                RecordSort::ScoreDesc => " ORDER BY profitability_score DESC",
                RecordSort::ProfitDesc => " ORDER BY estimated_profit DESC",
            });
        }

        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
        qb.push(" LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(query.skip as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("find query failed")?;
        rows.iter().map(Self::decode_record).collect()
    }

    async fn update_many(&self, filter: &RecordFilter, patch: &RecordPatch) -> Result<u64> {
        let Some(active) = patch.is_active else {
            return Ok(0);
        };
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("UPDATE arbitrage_records SET is_active = ");
        qb.push_bind(active);
        push_filter(&mut qb, filter);
        qb.push(" AND is_active <> ").push_bind(active);

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .context("update_many failed")?;
        Ok(result.rows_affected())
    }

    async fn delete_many(&self, filter: &RecordFilter) -> Result<u64> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("DELETE FROM arbitrage_records");
        push_filter(&mut qb, filter);
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .context("delete_many failed")?;
        Ok(result.rows_affected())
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) AS n FROM arbitrage_records");
        push_filter(&mut qb, filter);
        let row = qb
            .build()
            .fetch_one(&self.pool)
            .await
            .context("count query failed")?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

#[async_trait]
impl AuditLog for SqliteStore {
    async fn append(&self, record: &JobExecutionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_executions (job_name, status, payload, executed_at) VALUES (?, ?, ?, ?)",
        )
        .bind(record.job_name.as_str())
        .bind(record.status.to_string())
        .bind(record.payload.to_string())
        .bind(record.executed_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to append job record")?;
        Ok(())
    }

    async fn recent(&self, job_name: Option<&str>, limit: usize) -> Result<Vec<JobExecutionRecord>> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT job_name, status, payload, executed_at FROM job_executions",
        );
        if let Some(name) = job_name {
            qb.push(" WHERE job_name = ").push_bind(name.to_string());
        }
        qb.push(" ORDER BY id DESC LIMIT ").push_bind(limit as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Job log query failed")?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                let payload: String = row.try_get("payload")?;
                Ok(JobExecutionRecord {
                    job_name: row.try_get("job_name")?,
                    status: JobStatus::from_str(&status)?,
                    payload: serde_json::from_str(&payload).context("Corrupt job payload")?,
                    executed_at: from_millis(row.try_get("executed_at")?)?,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::sample_record;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_by_natural_key() {
        let store = memory_store().await;
        let record = sample_record("u1", 50, dec!(1200), Duration::hours(1));
        assert_eq!(store.upsert(record.clone()).await.unwrap(), UpsertOutcome::Inserted);

        let mut changed = record.clone();
        changed.profitability_score = Some(65);
        changed.estimated_profit = Some(dec!(3100));
        assert_eq!(store.upsert(changed).await.unwrap(), UpsertOutcome::Updated);

        assert_eq!(store.count(&RecordFilter::default()).await.unwrap(), 1);
        let stored = store.find_by_key(&record.natural_key()).await.unwrap().unwrap();
        assert_eq!(stored.profitability_score, Some(65));
        assert_eq!(stored.estimated_profit, Some(dec!(3100)));
        assert_eq!(stored.id, record.id);
    }

    #[tokio::test]
    async fn test_filters_and_sorts() {
        let store = memory_store().await;
        store.upsert(sample_record("a", 40, dec!(800), Duration::days(2))).await.unwrap();
        store.upsert(sample_record("b", 85, dec!(6000), Duration::days(1))).await.unwrap();
        let mut malformed = sample_record("c", 99, dec!(9000), Duration::days(3));
        malformed.estimated_profit = None;
        store.upsert(malformed).await.unwrap();

        let ranked = store
            .find(&RecordQuery::default().sort(RecordSort::ScoreDesc))
            .await
            .unwrap();
        let urls: Vec<_> = ranked.iter().map(|r| r.source_url.as_str()).collect();
        assert_eq!(urls, vec!["b", "a"]);

        let oldest = store
            .find(&RecordQuery::new(RecordFilter::active()).sort(RecordSort::LastUpdatedAsc).limit(1))
            .await
            .unwrap();
        assert_eq!(oldest[0].source_url, "c");

        assert_eq!(store.count(&RecordFilter::default().min_score(70)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_deactivate_then_purge() {
        let store = memory_store().await;
        store.upsert(sample_record("old", 50, dec!(1), Duration::days(100))).await.unwrap();
        store.upsert(sample_record("mid", 50, dec!(1), Duration::days(40))).await.unwrap();
        store.upsert(sample_record("new", 50, dec!(1), Duration::days(1))).await.unwrap();

        let stale = RecordFilter::active().updated_before(Utc::now() - Duration::days(30));
        assert_eq!(store.update_many(&stale, &RecordPatch::deactivate()).await.unwrap(), 2);

        let mid = store
            .find(&RecordQuery::new(RecordFilter::inactive()))
            .await
            .unwrap();
        assert_eq!(mid.len(), 2);
        assert!(mid.iter().all(|r| !r.is_active));

        let expired = RecordFilter::inactive().updated_before(Utc::now() - Duration::days(90));
        assert_eq!(store.delete_many(&expired).await.unwrap(), 1);
        assert_eq!(store.count(&RecordFilter::default()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_audit_log() {
        let store = memory_store().await;
        store
            .append(&JobExecutionRecord::success("hourly_updates", serde_json::json!({"refreshed": 4})))
            .await
            .unwrap();
        store
            .append(&JobExecutionRecord::error("exchange_rate_update", "timeout"))
            .await
            .unwrap();

        let all = store.recent(None, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].job_name, "exchange_rate_update");
        assert_eq!(all[0].status, JobStatus::Error);
        assert_eq!(all[0].payload["error"], "timeout");

        let refresh = store.recent(Some("hourly_updates"), 10).await.unwrap();
        assert_eq!(refresh.len(), 1);
        assert_eq!(refresh[0].payload["refreshed"], 4);
    }
}
