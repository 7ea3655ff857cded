//! JSON document backend.
//!
//! Records live in memory behind a mutex and, when a path is configured,
//! are written back as one pretty-printed JSON array (temp file + rename,
//! so a crash never leaves a truncated document). Upserts only mark the
//! document dirty; the reconciler flushes once per pass, so a batch of N
//! listings costs one write instead of N. Bulk updates and deletes write
//! immediately. The audit log is a JSON-lines file opened in append mode.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{AuditLog, ListingStore, RecordFilter, RecordPatch, RecordQuery, UpsertOutcome};
use crate::types::{ArbitrageRecord, JobExecutionRecord, NaturalKey};

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Save records to a JSON file.
fn save_records(path: &Path, records: &[ArbitrageRecord]) -> Result<()> {
    let json = serde_json::to_string_pretty(records).context("Failed to serialise records")?;
    ensure_parent(path)?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)
        .with_context(|| format!("Failed to write records to {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move records into {}", path.display()))?;

    debug!(path = %path.display(), count = records.len(), "Records saved");
    Ok(())
}

/// Load records from a JSON file. A missing file is an empty store.
fn load_records(path: &Path) -> Result<Vec<ArbitrageRecord>> {
    if !path.exists() {
        info!(path = %path.display(), "No saved records found, starting fresh");
        return Ok(Vec::new());
    }
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read records from {}", path.display()))?;
    let records: Vec<ArbitrageRecord> = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse records from {}", path.display()))?;
    info!(path = %path.display(), count = records.len(), "Records loaded from disk");
    Ok(records)
}

// ---------------------------------------------------------------------------
// Listing store
// ---------------------------------------------------------------------------

struct Document {
    records: Vec<ArbitrageRecord>,
    /// Upserts not yet written to disk.
    dirty: bool,
}

pub struct JsonStore {
    path: Option<PathBuf>,
    doc: Mutex<Document>,
    saves: AtomicU64,
}

impl JsonStore {
    fn with_records(path: Option<PathBuf>, records: Vec<ArbitrageRecord>) -> Self {
        Self {
            path,
            doc: Mutex::new(Document { records, dirty: false }),
            saves: AtomicU64::new(0),
        }
    }

    /// Volatile store; nothing touches disk.
    pub fn in_memory() -> Self {
        Self::with_records(None, Vec::new())
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = load_records(&path)?;
        Ok(Self::with_records(Some(path), records))
    }

    /// Number of document writes since open.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    fn save(&self, path: &Path, records: &[ArbitrageRecord]) -> Result<()> {
        self.saves.fetch_add(1, Ordering::Relaxed);
        save_records(path, records)
    }

    /// Apply `mutate` to a working copy, persist it, then commit. A failed
    /// write leaves the in-memory state unchanged.
    async fn mutate<T>(&self, mutate: impl FnOnce(&mut Vec<ArbitrageRecord>) -> T) -> Result<T> {
        let mut doc = self.doc.lock().await;
        let mut working = doc.records.clone();
        let out = mutate(&mut working);
        if let Some(path) = &self.path {
            self.save(path, &working)?;
        }
        doc.records = working;
        doc.dirty = false;
        Ok(out)
    }
}

impl Drop for JsonStore {
    fn drop(&mut self) {
        let Some(path) = &self.path else { return };
        let doc = self.doc.get_mut();
        if doc.dirty {
            if let Err(e) = save_records(path, &doc.records) {
                warn!(path = %path.display(), error = %e, "Failed to write pending records on close");
            }
        }
    }
}

#[async_trait]
impl ListingStore for JsonStore {
    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<ArbitrageRecord>> {
        let doc = self.doc.lock().await;
        Ok(doc.records.iter().find(|r| r.natural_key() == *key).cloned())
    }

    async fn upsert(&self, record: ArbitrageRecord) -> Result<UpsertOutcome> {
        let key = record.natural_key();
        let mut guard = self.doc.lock().await;
        let doc = &mut *guard;
        let outcome = match doc.records.iter_mut().find(|r| r.natural_key() == key) {
            Some(existing) => {
                *existing = record;
                UpsertOutcome::Updated
            }
            None => {
                doc.records.push(record);
                UpsertOutcome::Inserted
            }
        };
        doc.dirty = self.path.is_some();
        Ok(outcome)
    }

    async fn flush(&self) -> Result<()> {
        let mut doc = self.doc.lock().await;
        if let (true, Some(path)) = (doc.dirty, &self.path) {
            self.save(path, &doc.records)?;
            doc.dirty = false;
        }
        Ok(())
    }

    async fn find(&self, query: &RecordQuery) -> Result<Vec<ArbitrageRecord>> {
        let doc = self.doc.lock().await;
        Ok(query.apply(doc.records.iter()))
    }

    async fn update_many(&self, filter: &RecordFilter, patch: &RecordPatch) -> Result<u64> {
        let filter = filter.clone();
        let patch = patch.clone();
        self.mutate(move |records| {
            let mut modified = 0u64;
            for r in records.iter_mut().filter(|r| filter.matches(r)) {
                let before = r.is_active;
                patch.apply(r);
                if r.is_active != before {
                    modified += 1;
                }
            }
            modified
        })
        .await
    }

    async fn delete_many(&self, filter: &RecordFilter) -> Result<u64> {
        let filter = filter.clone();
        self.mutate(move |records| {
            let before = records.len();
            records.retain(|r| !filter.matches(r));
            (before - records.len()) as u64
        })
        .await
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64> {
        let doc = self.doc.lock().await;
        Ok(doc.records.iter().filter(|r| filter.matches(r)).count() as u64)
    }

    fn backend(&self) -> &'static str {
        if self.path.is_some() {
            "json"
        } else {
            "memory"
        }
    }
}

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

pub struct JsonAuditLog {
    path: Option<PathBuf>,
    entries: Mutex<Vec<JobExecutionRecord>>,
}

impl JsonAuditLog {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Open (or create on first append) a JSON-lines log. Unreadable lines
    /// are skipped with a warning.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = Vec::new();
        if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read job log {}", path.display()))?;
            for (lineno, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JobExecutionRecord>(line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!(line = lineno + 1, error = %e, "Skipping malformed job log line"),
                }
            }
            info!(path = %path.display(), count = entries.len(), "Job log loaded");
        }
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }
}

#[async_trait]
impl AuditLog for JsonAuditLog {
    async fn append(&self, record: &JobExecutionRecord) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(path) = &self.path {
            ensure_parent(path)?;
            let line = serde_json::to_string(record).context("Failed to serialise job record")?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open job log {}", path.display()))?;
            writeln!(file, "{line}")
                .with_context(|| format!("Failed to append to job log {}", path.display()))?;
        }
        entries.push(record.clone());
        Ok(())
    }

    async fn recent(&self, job_name: Option<&str>, limit: usize) -> Result<Vec<JobExecutionRecord>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .rev()
            .filter(|e| job_name.map_or(true, |name| e.job_name == name))
            .take(limit)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::sample_record;
    use crate::types::JobStatus;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn temp_path(ext: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("carbitrage_test_{}.{ext}", uuid::Uuid::new_v4()));
        p
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_key() {
        let store = JsonStore::in_memory();
        let first = sample_record("u1", 50, dec!(100), Duration::hours(2));
        assert_eq!(store.upsert(first.clone()).await.unwrap(), UpsertOutcome::Inserted);

        let mut again = first.clone();
        again.profitability_score = Some(70);
        assert_eq!(store.upsert(again).await.unwrap(), UpsertOutcome::Updated);

        assert_eq!(store.count(&RecordFilter::default()).await.unwrap(), 1);
        let stored = store.find_by_key(&first.natural_key()).await.unwrap().unwrap();
        assert_eq!(stored.profitability_score, Some(70));
    }

    #[tokio::test]
    async fn test_update_and_delete_many() {
        let store = JsonStore::in_memory();
        store.upsert(sample_record("old", 50, dec!(1), Duration::days(40))).await.unwrap();
        store.upsert(sample_record("new", 50, dec!(1), Duration::days(1))).await.unwrap();

        let stale = RecordFilter::active().updated_before(Utc::now() - Duration::days(30));
        assert_eq!(store.update_many(&stale, &RecordPatch::deactivate()).await.unwrap(), 1);
        assert_eq!(store.update_many(&stale, &RecordPatch::deactivate()).await.unwrap(), 0);
        assert_eq!(store.count(&RecordFilter::inactive()).await.unwrap(), 1);

        assert_eq!(store.delete_many(&RecordFilter::inactive()).await.unwrap(), 1);
        assert_eq!(store.count(&RecordFilter::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_file_roundtrip() {
        let path = temp_path("json");
        {
            let store = JsonStore::open(&path).unwrap();
            assert_eq!(store.backend(), "json");
            store.upsert(sample_record("u1", 80, dec!(5000), Duration::zero())).await.unwrap();
            assert!(!path.exists());
            store.flush().await.unwrap();
            assert_eq!(store.save_count(), 1);
        }
        let reopened = JsonStore::open(&path).unwrap();
        let all = reopened.find(&RecordQuery::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].profitability_score, Some(80));
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_clean_flush_writes_nothing() {
        let path = temp_path("json");
        let store = JsonStore::open(&path).unwrap();
        store.flush().await.unwrap();
        assert_eq!(store.save_count(), 0);

        store.upsert(sample_record("u1", 50, dec!(1), Duration::zero())).await.unwrap();
        store.flush().await.unwrap();
        store.flush().await.unwrap();
        assert_eq!(store.save_count(), 1);
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_pending_upserts_written_on_drop() {
        let path = temp_path("json");
        {
            let store = JsonStore::open(&path).unwrap();
            store.upsert(sample_record("u1", 50, dec!(1), Duration::zero())).await.unwrap();
        }
        let reopened = JsonStore::open(&path).unwrap();
        assert_eq!(reopened.count(&RecordFilter::default()).await.unwrap(), 1);
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_unchanged() {
        // A directory cannot be replaced by a file rename.
        let dir = temp_path("d");
        std::fs::create_dir_all(&dir).unwrap();
        let store = JsonStore::with_records(Some(dir.clone()), Vec::new());

        store.upsert(sample_record("u1", 50, dec!(1), Duration::zero())).await.unwrap();
        assert!(store.flush().await.is_err());
        assert!(store.doc.lock().await.dirty);

        let result = store.update_many(&RecordFilter::active(), &RecordPatch::deactivate()).await;
        assert!(result.is_err());
        assert_eq!(store.count(&RecordFilter::active()).await.unwrap(), 1);

        store.doc.lock().await.dirty = false;
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
        let _ = std::fs::remove_file(dir.with_extension("json.tmp"));
    }

    #[tokio::test]
    async fn test_audit_log_newest_first() {
        let path = temp_path("jsonl");
        let log = JsonAuditLog::open(&path).unwrap();
        log.append(&JobExecutionRecord::success("a", serde_json::json!({"n": 1})))
            .await
            .unwrap();
        log.append(&JobExecutionRecord::error("b", "boom")).await.unwrap();
        log.append(&JobExecutionRecord::success("a", serde_json::json!({"n": 2})))
            .await
            .unwrap();

        let recent = log.recent(None, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].payload["n"], 2);
        assert_eq!(recent[1].status, JobStatus::Error);

        let only_a = log.recent(Some("a"), 10).await.unwrap();
        assert_eq!(only_a.len(), 2);

        let reopened = JsonAuditLog::open(&path).unwrap();
        assert_eq!(reopened.recent(None, 10).await.unwrap().len(), 3);
        std::fs::remove_file(&path).unwrap();
    }
}
