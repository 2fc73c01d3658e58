//! Daily progress snapshots.
//!
//! A sweep recomputes every project and records today's progress. The daily
//! timer and the manual "run now" trigger both go through the same
//! first-write-wins upsert, so running the sweep any number of times on one
//! day leaves exactly one entry per project.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::db::{self, SharedConnection, SnapshotMode, UpsertOutcome};
use crate::error::{Error, Result};
use crate::progress;
use crate::types::{ProjectId, SnapshotEntry};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SweepSummary {
    pub day: NaiveDate,
    pub attempted: usize,
    pub written: usize,
    pub skipped_already_present: usize,
    pub errors: Vec<(ProjectId, String)>,
    /// How many of `errors` a later sweep may clear.
    pub retryable: usize,
}

impl SweepSummary {
    fn new(day: NaiveDate) -> Self {
        Self {
            day,
            attempted: 0,
            written: 0,
            skipped_already_present: 0,
            errors: Vec::new(),
            retryable: 0,
        }
    }
}

/// Delay before a sweep with retryable failures runs again.
pub const DEFAULT_RETRY_DELAY: StdDuration = StdDuration::from_secs(5 * 60);

pub struct Scheduler {
    conn: SharedConnection,
    clock: Arc<dyn Clock>,
    note: String,
    sweep_at: NaiveTime,
    retry_delay: StdDuration,
    in_flight: AsyncMutex<()>,
}

impl Scheduler {
    pub fn new(
        conn: SharedConnection,
        clock: Arc<dyn Clock>,
        note: impl Into<String>,
        sweep_at: NaiveTime,
    ) -> Self {
        Self {
            conn,
            clock,
            note: note.into(),
            sweep_at,
            retry_delay: DEFAULT_RETRY_DELAY,
            in_flight: AsyncMutex::new(()),
        }
    }

    pub fn with_retry_delay(mut self, delay: StdDuration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Records today's progress for a project unless an entry already exists.
    pub fn upsert_today(&self, project_id: ProjectId, progress: u8, note: &str) -> Result<UpsertOutcome> {
        self.write_today(project_id, progress, note, SnapshotMode::Sweep)
    }

    /// Overwrites today's entry. Earlier days cannot be corrected.
    pub fn correct_today(&self, project_id: ProjectId, progress: u8, note: &str) -> Result<UpsertOutcome> {
        self.write_today(project_id, progress, note, SnapshotMode::Correction)
    }

    fn write_today(
        &self,
        project_id: ProjectId,
        progress: u8,
        note: &str,
        mode: SnapshotMode,
    ) -> Result<UpsertOutcome> {
        if progress > 100 {
            return Err(Error::Validation(format!("progress {progress} is above 100")));
        }
        let conn = self.conn.lock();
        if db::query_project_by_id(project_id, &conn)?.is_none() {
            return Err(Error::not_found("project", project_id));
        }
        let entry = SnapshotEntry {
            project_id,
            day: self.clock.today(),
            progress,
            note: note.to_string(),
            recorded_at: self.clock.now(),
        };
        let outcome = db::upsert_snapshot(&entry, mode, &conn)?;
        debug!(project = project_id, day = %entry.day, ?outcome, "snapshot upsert");
        Ok(outcome)
    }

    /// Recomputes and persists the project's derived fields, then records
    /// the snapshot.
    fn snapshot_project(&self, project_id: ProjectId) -> Result<UpsertOutcome> {
        let (project, change) = db::update_project(project_id, &self.conn.lock(), |p| Ok(progress::recompute(p)))?
            .ok_or_else(|| Error::not_found("project", project_id))?;
        if change.changed() {
            info!(project = project_id, progress = project.progress, "stale progress repaired by sweep");
        }
        self.upsert_today(project_id, project.progress, &self.note)
    }

    /// One pass over all projects. A failing project is reported in the
    /// summary and does not stop the others. Overlapping calls run one after
    /// the other.
    pub async fn run_daily_sweep(&self) -> Result<SweepSummary> {
        let _guard = self.in_flight.lock().await;
        let mut summary = SweepSummary::new(self.clock.today());
        let ids = db::query_project_ids(&self.conn.lock())?;

        for project_id in ids {
            summary.attempted += 1;
            match self.snapshot_project(project_id) {
                Ok(UpsertOutcome::Created | UpsertOutcome::Updated) => summary.written += 1,
                Ok(UpsertOutcome::AlreadyPresent) => summary.skipped_already_present += 1,
                Err(err) => {
                    warn!(project = project_id, error = %err, "snapshot failed");
                    if err.is_retryable() {
                        summary.retryable += 1;
                    }
                    summary.errors.push((project_id, err.to_string()));
                }
            }
            tokio::task::yield_now().await;
        }

        info!(
            day = %summary.day,
            attempted = summary.attempted,
            written = summary.written,
            skipped = summary.skipped_already_present,
            errors = summary.errors.len(),
            "snapshot sweep finished"
        );
        Ok(summary)
    }

    pub fn history(&self, project_id: ProjectId) -> Result<Vec<SnapshotEntry>> {
        db::query_snapshots_for_project(project_id, &self.conn.lock())
    }

    pub fn next_run(&self) -> DateTime<Utc> {
        next_run_after(self.clock.now(), self.clock.offset(), self.sweep_at)
    }

    /// Runs the sweep every day at the configured reference-local time.
    pub fn spawn_daily(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = self.clock.now();
                let next = next_run_after(now, self.clock.offset(), self.sweep_at);
                info!(next = %next, "next snapshot sweep scheduled");
                let wait = (next - now).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                self.sweep_until_settled().await;
            }
        })
    }

    /// Runs the sweep and repeats it after the retry delay while retryable
    /// failures remain and the reference day has not changed. Repeats only
    /// write the projects that are still missing today's entry.
    async fn sweep_until_settled(&self) {
        let day = self.clock.today();
        loop {
            let retry = match self.run_daily_sweep().await {
                Ok(summary) => summary.retryable > 0,
                Err(err) if err.is_retryable() => {
                    warn!(error = %err, "snapshot sweep aborted");
                    true
                }
                Err(err) => {
                    error!(error = %err, "snapshot sweep aborted, retrying next cycle");
                    false
                }
            };
            if !retry {
                return;
            }
            tokio::time::sleep(self.retry_delay).await;
            if self.clock.today() != day {
                warn!(day = %day, "day rolled over before the sweep succeeded");
                return;
            }
            info!(day = %day, "retrying snapshot sweep");
        }
    }
}

/// The first instant strictly after `now` whose wall time in `offset` is `at`.
pub fn next_run_after(now: DateTime<Utc>, offset: FixedOffset, at: NaiveTime) -> DateTime<Utc> {
    let local_day = now.with_timezone(&offset).date_naive();
    let candidate = |day: NaiveDate| -> DateTime<Utc> {
        // A fixed offset has no gaps or folds, so every local time maps to one instant.
        offset
            .from_local_datetime(&day.and_time(at))
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now)
    };
    let today = candidate(local_day);
    if today > now {
        today
    } else {
        candidate(local_day + Duration::days(1))
    }
}
