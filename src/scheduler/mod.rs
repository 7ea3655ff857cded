//! In-process scheduler for the standing jobs.
//!
//! Each registered job gets its own ticker task firing on a wall-clock
//! cron rule in a configured timezone (or a fixed period, for tests and
//! ad-hoc jobs). Every firing runs in a separate tracked task behind the
//! job's running flag, so a slow run never delays the ticker and a firing
//! that lands while the previous run is still going is skipped (and
//! counted) rather than queued. Each run is wrapped in a failure boundary:
//! errors and panics become an `error` audit record and never reach the
//! ticker or the other jobs.
//!
//! ```text
//! stopped ──start──► scheduled ──tick──► running ──done──► scheduled
//!    ▲                   │                                    │
//!    └──────stop─────────┴────────────────stop────────────────┘
//! ```
//!
//! Stopping a job ends its future firings only. Runs are cancelled through
//! the process-wide shutdown token, and [`Scheduler::shutdown`] waits for
//! them to wind down.

pub mod jobs;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::storage::AuditLog;
use crate::types::{ArbError, JobExecutionRecord, JobStatus};

/// A unit of scheduled work. The returned JSON becomes the payload of the
/// `success` audit record.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, cancel: &CancellationToken) -> Result<serde_json::Value>;
}

// ---------------------------------------------------------------------------
// Cadence and clock
// ---------------------------------------------------------------------------

/// When a job fires.
#[derive(Debug, Clone)]
pub enum Cadence {
    /// Fixed period counted from when the job is started.
    Every(Duration),
    /// Cron rule (seconds field first) evaluated in `timezone`.
    Cron {
        expression: String,
        schedule: cron::Schedule,
        timezone: Tz,
    },
}

impl Cadence {
    pub fn cron(expression: &str, timezone: &str) -> Result<Self, ArbError> {
        let schedule = cron::Schedule::from_str(expression)
            .map_err(|e| ArbError::InvalidConfig(format!("invalid cron expression '{expression}': {e}")))?;
        let timezone = Tz::from_str(timezone)
            .map_err(|_| ArbError::InvalidConfig(format!("unknown timezone '{timezone}'")))?;
        Ok(Cadence::Cron {
            expression: expression.to_string(),
            schedule,
            timezone,
        })
    }

    /// First firing strictly after `after`. `None` for fixed periods and
    /// for rules with no future occurrence.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Every(_) => None,
            Cadence::Cron { schedule, timezone, .. } => schedule
                .after(&after.with_timezone(timezone))
                .next()
                .map(|t| t.with_timezone(&Utc)),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Cadence::Every(period) => format!("every {}s", period.as_secs()),
            Cadence::Cron { expression, timezone, .. } => format!("{expression} ({})", timezone.name()),
        }
    }
}

impl From<Duration> for Cadence {
    fn from(period: Duration) -> Self {
        Cadence::Every(period)
    }
}

/// Source of wall-clock time for cron rules.
#[derive(Debug, Clone, Copy)]
pub enum WallClock {
    System,
    /// Wall time `at` when the runtime clock read `origin`, advancing with
    /// the runtime clock (and so with a paused test clock).
    Anchored { at: DateTime<Utc>, origin: Instant },
}

impl WallClock {
    pub fn anchored(at: DateTime<Utc>) -> Self {
        WallClock::Anchored {
            at,
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self {
            WallClock::System => Utc::now(),
            WallClock::Anchored { at, origin } => {
                *at + chrono::Duration::from_std(origin.elapsed()).unwrap_or_else(|_| chrono::Duration::zero())
            }
        }
    }
}

/// Firing source for one ticker.
enum Ticks {
    Every(Interval),
    Cron {
        cadence: Cadence,
        clock: WallClock,
        last: Option<DateTime<Utc>>,
    },
}

impl Ticks {
    fn new(cadence: &Cadence, clock: WallClock) -> Self {
        match cadence {
            Cadence::Every(period) => {
                let mut interval = interval_at(Instant::now() + *period, *period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                Ticks::Every(interval)
            }
            Cadence::Cron { .. } => Ticks::Cron {
                cadence: cadence.clone(),
                clock,
                last: None,
            },
        }
    }

    /// Wait for the next firing. `false` when there will be none. Firings
    /// missed while the process was busy or asleep are skipped.
    async fn next(&mut self) -> bool {
        match self {
            Ticks::Every(interval) => {
                interval.tick().await;
                true
            }
            Ticks::Cron { cadence, clock, last } => {
                let now = clock.now();
                let from = last.map_or(now, |l| l.max(now));
                let Some(next) = cadence.next_after(from) else {
                    return false;
                };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                *last = Some(next);
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Job slots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Stopped,
    Scheduled,
    Running,
}

/// Point-in-time view of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub name: String,
    pub state: JobState,
    pub schedule: String,
    pub runs: u64,
    pub failures: u64,
    pub skipped: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<JobStatus>,
}

/// Result of asking for an immediate run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Default)]
struct JobStats {
    runs: u64,
    failures: u64,
    skipped: u64,
    last_run: Option<DateTime<Utc>>,
    last_status: Option<JobStatus>,
}

struct JobSlot {
    job: Arc<dyn ScheduledJob>,
    cadence: Cadence,
    running: AtomicBool,
    stats: Mutex<JobStats>,
    ticker: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl JobSlot {
    fn name(&self) -> &str {
        self.job.name()
    }

    /// Claim the running flag. `false` when a run is already in progress.
    fn try_claim(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn state(&self) -> JobState {
        if self.running.load(Ordering::Acquire) {
            JobState::Running
        } else if self.ticker.lock().is_some() {
            JobState::Scheduled
        } else {
            JobState::Stopped
        }
    }

    fn report(&self) -> JobReport {
        let stats = self.stats.lock();
        JobReport {
            name: self.name().to_string(),
            state: self.state(),
            schedule: self.cadence.describe(),
            runs: stats.runs,
            failures: stats.failures,
            skipped: stats.skipped,
            last_run: stats.last_run,
            last_status: stats.last_status,
        }
    }
}

/// Releases the running flag even if the run unwinds.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Execute a job whose running flag the caller has already claimed.
async fn execute_claimed(slot: &JobSlot, audit: &dyn AuditLog, cancel: &CancellationToken) -> JobExecutionRecord {
    let _guard = RunningGuard(&slot.running);
    let name = slot.name();
    let started = Instant::now();
    info!(job = name, "Job starting");

    let outcome = AssertUnwindSafe(slot.job.run(cancel)).catch_unwind().await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let record = match outcome {
        Ok(Ok(payload)) => {
            info!(job = name, elapsed_ms, "Job succeeded");
            JobExecutionRecord::success(name, payload)
        }
        Ok(Err(e)) => {
            error!(job = name, elapsed_ms, error = %format!("{e:#}"), "Job failed");
            JobExecutionRecord::error(name, format!("{e:#}"))
        }
        Err(_) => {
            error!(job = name, elapsed_ms, "Job panicked");
            JobExecutionRecord::error(name, "job panicked")
        }
    };

    {
        let mut stats = slot.stats.lock();
        stats.runs += 1;
        if record.status == JobStatus::Error {
            stats.failures += 1;
        }
        stats.last_run = Some(record.executed_at);
        stats.last_status = Some(record.status);
    }

    if let Err(e) = audit.append(&record).await {
        error!(job = name, error = %e, "Failed to write job execution record");
    }
    record
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    slots: Vec<Arc<JobSlot>>,
    audit: Arc<dyn AuditLog>,
    shutdown: CancellationToken,
    clock: WallClock,
    runs: TaskTracker,
}

impl Scheduler {
    /// `shutdown` is the process-wide token; every run token is a child of it.
    pub fn new(audit: Arc<dyn AuditLog>, shutdown: CancellationToken) -> Self {
        Self {
            slots: Vec::new(),
            audit,
            shutdown,
            clock: WallClock::System,
            runs: TaskTracker::new(),
        }
    }

    /// Evaluate cron rules against `clock` instead of the system time.
    pub fn with_clock(mut self, clock: WallClock) -> Self {
        self.clock = clock;
        self
    }

    /// Register a job. Registration order is the order reported by `status`.
    pub fn register(&mut self, job: Arc<dyn ScheduledJob>, cadence: impl Into<Cadence>) {
        let cadence = cadence.into();
        info!(job = job.name(), schedule = %cadence.describe(), "Job registered");
        self.slots.push(Arc::new(JobSlot {
            job,
            cadence,
            running: AtomicBool::new(false),
            stats: Mutex::new(JobStats::default()),
            ticker: Mutex::new(None),
        }));
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    pub fn job_names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name().to_string()).collect()
    }

    fn slot(&self, name: &str) -> Result<&Arc<JobSlot>, ArbError> {
        self.slots
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| ArbError::UnknownJob(name.to_string()))
    }

    pub fn start_all(&self) {
        for slot in &self.slots {
            self.spawn_ticker(slot);
        }
        info!(jobs = self.slots.len(), "Scheduler started");
    }

    /// Start one job's ticker. Starting a scheduled job is a no-op.
    pub fn start_job(&self, name: &str) -> Result<(), ArbError> {
        let slot = self.slot(name)?;
        self.spawn_ticker(slot);
        Ok(())
    }

    fn spawn_ticker(&self, slot: &Arc<JobSlot>) {
        let mut ticker = slot.ticker.lock();
        if ticker.is_some() {
            debug!(job = slot.name(), "Job already scheduled");
            return;
        }

        let ticker_token = self.shutdown.child_token();
        let task_token = ticker_token.clone();
        let task_slot = slot.clone();
        let audit = self.audit.clone();
        let shutdown = self.shutdown.clone();
        let runs = self.runs.clone();
        let clock = self.clock;

        let handle = tokio::spawn(async move {
            let mut ticks = Ticks::new(&task_slot.cadence, clock);

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    fired = ticks.next() => {
                        if !fired {
                            warn!(job = task_slot.name(), "Schedule has no further firings");
                            break;
                        }
                    }
                }

                if !task_slot.try_claim() {
                    task_slot.stats.lock().skipped += 1;
                    warn!(job = task_slot.name(), "Previous run still in progress, skipping this firing");
                    continue;
                }

                let run_slot = task_slot.clone();
                let run_audit = audit.clone();
                let run_token = shutdown.child_token();
                runs.spawn(async move {
                    execute_claimed(&run_slot, run_audit.as_ref(), &run_token).await;
                });
            }
            debug!(job = task_slot.name(), "Ticker stopped");
        });

        *ticker = Some((handle, ticker_token));
        info!(job = slot.name(), schedule = %slot.cadence.describe(), "Job scheduled");
    }

    /// Stop one job's future firings. A run already in progress finishes.
    pub fn stop_job(&self, name: &str) -> Result<(), ArbError> {
        let slot = self.slot(name)?;
        if let Some((_, token)) = slot.ticker.lock().take() {
            token.cancel();
            info!(job = name, "Job stopped");
        }
        Ok(())
    }

    /// Stop every ticker. Safe to call repeatedly and from a signal handler.
    pub fn stop_all_jobs(&self) {
        let mut stopped = 0usize;
        for slot in &self.slots {
            if let Some((_, token)) = slot.ticker.lock().take() {
                token.cancel();
                stopped += 1;
            }
        }
        if stopped > 0 {
            info!(stopped, "All jobs stopped");
        }
    }

    /// Cancel in-flight runs, stop every ticker and wait up to `grace` for
    /// the runs to finish their current write and audit record. `false`
    /// when the grace period ran out first.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutdown.cancel();
        self.stop_all_jobs();
        self.runs.close();

        let pending = self.runs.len();
        if pending > 0 {
            info!(pending, grace_secs = grace.as_secs(), "Waiting for in-flight runs");
        }
        match timeout(grace, self.runs.wait()).await {
            Ok(()) => {
                info!("Scheduler shut down");
                true
            }
            Err(_) => {
                warn!(pending = self.runs.len(), "In-flight runs did not finish before the grace period");
                false
            }
        }
    }

    pub fn status(&self) -> Vec<JobReport> {
        self.slots.iter().map(|s| s.report()).collect()
    }

    pub fn is_running(&self, name: &str) -> Result<bool, ArbError> {
        Ok(self.slot(name)?.state() == JobState::Running)
    }

    /// Fire-and-forget run outside the schedule, audited like a scheduled run.
    pub fn trigger(&self, name: &str) -> Result<TriggerOutcome, ArbError> {
        let slot = self.slot(name)?.clone();
        if !slot.try_claim() {
            return Ok(TriggerOutcome::AlreadyRunning);
        }
        let audit = self.audit.clone();
        let token = self.shutdown.child_token();
        info!(job = name, "Manual trigger");
        self.runs.spawn(async move {
            execute_claimed(&slot, audit.as_ref(), &token).await;
        });
        Ok(TriggerOutcome::Started)
    }

    /// Run a job to completion in the caller's task. `None` when the job
    /// is already running.
    pub async fn run_once(&self, name: &str) -> Result<Option<JobExecutionRecord>, ArbError> {
        let slot = self.slot(name)?;
        if !slot.try_claim() {
            return Ok(None);
        }
        let token = self.shutdown.child_token();
        let run = execute_claimed(slot, self.audit.as_ref(), &token);
        Ok(Some(self.runs.track_future(run).await))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop_all_jobs();
    }
}
