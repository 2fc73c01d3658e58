//! Clock ledger: validation of new clock events, the authoritative
//! append-only store, and work-duration computation.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::{self, SharedConnection};
use crate::error::{Error, Result};
use crate::types::{ClockEvent, ClockKind, NewClockEvent, ProjectId, ServerId, WorkerId};

/// Turns a draft into a pending event with a fresh local id. The time
/// defaults to `now` when the draft carries none.
pub fn prepare_event(draft: NewClockEvent, now: DateTime<Utc>) -> Result<ClockEvent> {
    let worker = draft
        .worker
        .ok_or_else(|| Error::Validation("clock event requires a worker".into()))?;
    let project = draft
        .project
        .ok_or_else(|| Error::Validation("clock event requires a project".into()))?;
    let kind = draft
        .kind
        .ok_or_else(|| Error::Validation("clock event requires a type".into()))?;
    Ok(ClockEvent {
        local_id: Uuid::new_v4().to_string(),
        worker,
        project: Some(project),
        kind,
        at: draft.at.unwrap_or(now),
        location: draft.location,
        server_id: None,
        synced: false,
    })
}

/// The authoritative store behind the reconciler.
pub struct ClockLedger {
    conn: SharedConnection,
    clock: Arc<dyn Clock>,
}

impl ClockLedger {
    pub fn new(conn: SharedConnection, clock: Arc<dyn Clock>) -> Self {
        Self { conn, clock }
    }

    /// Validates and records a new event directly, bypassing any local queue.
    pub fn append(&self, draft: NewClockEvent) -> Result<ClockEvent> {
        let mut event = prepare_event(draft, self.clock.now())?;
        let server_id = self.record(&event)?;
        event.confirm(server_id);
        Ok(event)
    }

    /// Records a submitted event. Submitting the same local id again returns
    /// the server id assigned the first time.
    pub fn record(&self, event: &ClockEvent) -> Result<ServerId> {
        let (server_id, created) = db::insert_ledger_event(event, self.clock.now(), &self.conn.lock())?;
        if created {
            debug!(local_id = %event.local_id, server_id, "ledger event recorded");
        } else {
            debug!(local_id = %event.local_id, server_id, "duplicate ledger submission ignored");
        }
        Ok(server_id)
    }

    pub fn list_since(&self, worker: Option<WorkerId>, since: Option<DateTime<Utc>>) -> Result<Vec<ClockEvent>> {
        db::query_ledger_events(worker, since, &self.conn.lock())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DurationReport {
    pub total_minutes: i64,
    pub by_project: BTreeMap<ProjectId, i64>,
    /// Closed sessions where neither event named a project.
    pub unattributed_minutes: i64,
}

impl DurationReport {
    fn add(&mut self, project: Option<ProjectId>, minutes: i64) {
        self.total_minutes += minutes;
        match project {
            Some(project) => *self.by_project.entry(project).or_default() += minutes,
            None => self.unattributed_minutes += minutes,
        }
    }
}

/// At the same instant a clock-out closes the running session before a
/// clock-in opens the next one.
fn kind_rank(kind: ClockKind) -> u8 {
    match kind {
        ClockKind::ClockOut => 0,
        ClockKind::ClockIn => 1,
    }
}

/// Worked minutes per worker.
///
/// Each worker's events are sorted by time and walked in order: a clock-in
/// opens a session and the next clock-out closes it. A second clock-in
/// replaces the open one, an unmatched clock-out adds nothing, and a session
/// still open at the end adds nothing.
pub fn durations(events: &[ClockEvent]) -> BTreeMap<WorkerId, DurationReport> {
    let mut per_worker: BTreeMap<WorkerId, Vec<&ClockEvent>> = BTreeMap::new();
    for event in events {
        per_worker.entry(event.worker).or_default().push(event);
    }

    per_worker
        .into_iter()
        .map(|(worker, mut stream)| {
            stream.sort_by(|a, b| {
                a.at.cmp(&b.at)
                    .then_with(|| kind_rank(a.kind).cmp(&kind_rank(b.kind)))
                    .then_with(|| a.local_id.cmp(&b.local_id))
            });
            let mut report = DurationReport::default();
            let mut open: Option<&ClockEvent> = None;
            for event in stream {
                match event.kind {
                    ClockKind::ClockIn => open = Some(event),
                    ClockKind::ClockOut => {
                        if let Some(start) = open.take() {
                            let minutes = (event.at - start.at).num_minutes().max(0);
                            report.add(start.project.or(event.project), minutes);
                        }
                    }
                }
            }
            (worker, report)
        })
        .collect()
}
