//! Offline-first clock capture and reconciliation.
//!
//! Clock events are written to the local queue as pending and transmitted to
//! the authoritative ledger when a sync runs: right after capture, when
//! connectivity comes back, or on request. Each pending event moves to
//! confirmed exactly once, when the ledger returns its server id.
//!
//! # Merge Semantics
//!
//! Local and fetched histories are merged by identity: server id first,
//! local id second. A fetched event carrying the local id of a pending local
//! event confirms that event instead of being added beside it, so a logical
//! event never appears twice in the merged view.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::db::{self, SharedConnection};
use crate::error::Result;
use crate::ledger::{ClockLedger, prepare_event};
use crate::types::{ClockEvent, ExportedClockEvent, LocalId, NewClockEvent, ServerId, WorkerId};

/// Host-supplied online/offline signal.
pub type Connectivity = watch::Receiver<bool>;

/// Transport to the authoritative ledger. `submit` must be safe to repeat
/// for the same event.
#[async_trait]
pub trait LedgerTransport: Send + Sync {
    async fn submit(&self, event: &ClockEvent) -> Result<ServerId>;

    async fn fetch_since(
        &self,
        worker: Option<WorkerId>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ClockEvent>>;
}

/// Transport backed by a ledger database reachable from this process.
pub struct LocalLedgerTransport {
    ledger: Arc<ClockLedger>,
}

impl LocalLedgerTransport {
    pub fn new(ledger: Arc<ClockLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl LedgerTransport for LocalLedgerTransport {
    async fn submit(&self, event: &ClockEvent) -> Result<ServerId> {
        self.ledger.record(event)
    }

    async fn fetch_since(
        &self,
        worker: Option<WorkerId>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ClockEvent>> {
        self.ledger.list_since(worker, since)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub attempted: usize,
    pub confirmed: usize,
    pub failed: Vec<(LocalId, String)>,
    /// Another drain was running; nothing was attempted.
    pub skipped_in_flight: bool,
    /// Connectivity reported offline; nothing was attempted.
    pub offline: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MergeResult {
    /// Merged events sorted by `(at, local_id)`.
    pub events: Vec<ClockEvent>,
    /// Pending local events confirmed by a fetched counterpart.
    pub confirmed_local: usize,
    /// Fetched events with no local counterpart.
    pub new_remote: usize,
    pub duplicates_skipped: usize,
}

pub fn merge_histories(local: &[ClockEvent], remote: &[ClockEvent]) -> MergeResult {
    let mut events: Vec<ClockEvent> = Vec::with_capacity(local.len() + remote.len());
    let mut by_server: HashMap<ServerId, usize> = HashMap::new();
    let mut by_local: HashMap<LocalId, usize> = HashMap::new();
    let mut confirmed_local = 0;
    let mut new_remote = 0;
    let mut duplicates_skipped = 0;

    for (event, is_remote) in local
        .iter()
        .map(|e| (e, false))
        .chain(remote.iter().map(|e| (e, true)))
    {
        let existing = event
            .server_id
            .and_then(|id| by_server.get(&id))
            .or_else(|| by_local.get(&event.local_id))
            .copied();
        match existing {
            Some(idx) => {
                duplicates_skipped += 1;
                let slot = &mut events[idx];
                if let (false, Some(server_id)) = (slot.synced, event.server_id) {
                    slot.confirm(server_id);
                    by_server.insert(server_id, idx);
                    if is_remote {
                        confirmed_local += 1;
                    }
                }
            }
            None => {
                let idx = events.len();
                if let Some(server_id) = event.server_id {
                    by_server.insert(server_id, idx);
                }
                by_local.insert(event.local_id.clone(), idx);
                events.push(event.clone());
                if is_remote {
                    new_remote += 1;
                }
            }
        }
    }

    events.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.local_id.cmp(&b.local_id)));
    MergeResult {
        events,
        confirmed_local,
        new_remote,
        duplicates_skipped,
    }
}

pub struct Reconciler {
    conn: SharedConnection,
    transport: Arc<dyn LedgerTransport>,
    clock: Arc<dyn Clock>,
    owner: WorkerId,
    online: Connectivity,
    drain: AsyncMutex<()>,
}

impl Reconciler {
    pub fn new(
        conn: SharedConnection,
        transport: Arc<dyn LedgerTransport>,
        clock: Arc<dyn Clock>,
        owner: WorkerId,
        online: Connectivity,
    ) -> Self {
        Self {
            conn,
            transport,
            clock,
            owner,
            online,
            drain: AsyncMutex::new(()),
        }
    }

    /// Captures an event locally as pending. Only validation can fail here.
    pub fn append(&self, draft: NewClockEvent) -> Result<ClockEvent> {
        let event = prepare_event(draft, self.clock.now())?;
        db::store_clock_event(&event, self.owner, &self.conn.lock())?;
        debug!(local_id = %event.local_id, kind = %event.kind, "clock event captured");
        Ok(event)
    }

    /// Captures an event and makes a best-effort attempt to send it.
    pub async fn append_and_sync(&self, draft: NewClockEvent) -> Result<(ClockEvent, SyncSummary)> {
        let event = self.append(draft)?;
        let summary = self.sync_pending().await?;
        let current = db::query_clock_event(&event.local_id, &self.conn.lock())?.unwrap_or(event);
        Ok((current, summary))
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Sends every pending event owned by this session once. Failures stay
    /// pending for the next trigger.
    pub async fn sync_pending(&self) -> Result<SyncSummary> {
        let Ok(_guard) = self.drain.try_lock() else {
            debug!("sync already in flight");
            return Ok(SyncSummary {
                skipped_in_flight: true,
                ..SyncSummary::default()
            });
        };
        if !self.is_online() {
            return Ok(SyncSummary {
                offline: true,
                ..SyncSummary::default()
            });
        }

        let pending = db::query_pending_events(self.owner, &self.conn.lock())?;
        let mut summary = SyncSummary::default();
        for event in pending {
            summary.attempted += 1;
            let submitted = self.transport.submit(&event).await;
            let outcome = submitted
                .and_then(|server_id| db::mark_synced(&event.local_id, server_id, &self.conn.lock()));
            match outcome {
                Ok(()) => summary.confirmed += 1,
                Err(err) => {
                    warn!(local_id = %event.local_id, error = %err, "clock event not yet synced");
                    summary.failed.push((event.local_id, err.to_string()));
                }
            }
        }

        if summary.attempted > 0 {
            info!(
                attempted = summary.attempted,
                confirmed = summary.confirmed,
                failed = summary.failed.len(),
                "sync drain finished"
            );
        }
        Ok(summary)
    }

    /// Fetches the authoritative history and merges it into the local view.
    pub async fn refresh_history(
        &self,
        worker: Option<WorkerId>,
        since: Option<DateTime<Utc>>,
    ) -> Result<MergeResult> {
        let remote = self.transport.fetch_since(worker, since).await?;
        self.merge_into_local(worker, &remote)
    }

    /// Fetches only what the ledger recorded at or after the newest event
    /// already confirmed locally; the whole history when nothing is.
    pub async fn refresh_recent(&self, worker: Option<WorkerId>) -> Result<MergeResult> {
        let since = db::query_latest_confirmed_at(worker, &self.conn.lock())?;
        self.refresh_history(worker, since).await
    }

    /// Merges an exported history, registering embedded worker records in the
    /// directory.
    pub fn import(&self, exported: Vec<ExportedClockEvent>) -> Result<MergeResult> {
        let mut remote = Vec::with_capacity(exported.len());
        {
            let conn = self.conn.lock();
            for item in exported {
                let (event, record) = item.into_canonical();
                if let Some(record) = record {
                    db::upsert_worker(&record, &conn)?;
                }
                remote.push(event);
            }
        }
        self.merge_into_local(None, &remote)
    }

    fn merge_into_local(&self, worker: Option<WorkerId>, remote: &[ClockEvent]) -> Result<MergeResult> {
        let conn = self.conn.lock();
        let local = db::query_clock_events(worker, &conn)?;
        let merged = merge_histories(&local, remote);
        let tx = conn.unchecked_transaction()?;
        for event in &merged.events {
            // Existing rows keep their owner; foreign events belong to their worker.
            db::store_clock_event(event, event.worker, &tx)?;
        }
        tx.commit()?;
        info!(
            new_remote = merged.new_remote,
            confirmed_local = merged.confirmed_local,
            duplicates = merged.duplicates_skipped,
            "history merged"
        );
        Ok(merged)
    }

    /// The local view, one entry per logical event, ordered by time.
    pub fn merged_history(&self, worker: Option<WorkerId>) -> Result<Vec<ClockEvent>> {
        let local = db::query_clock_events(worker, &self.conn.lock())?;
        Ok(merge_histories(&local, &[]).events)
    }

    /// Drains the queue on every offline to online transition.
    pub fn watch_connectivity(self: Arc<Self>) -> JoinHandle<()> {
        let mut online = self.online.clone();
        // Baseline taken before spawning so an early transition is not lost.
        let mut was_online = *online.borrow_and_update();
        tokio::spawn(async move {
            while online.changed().await.is_ok() {
                let now_online = *online.borrow_and_update();
                if now_online && !was_online {
                    info!("connectivity restored, syncing pending clock events");
                    if let Err(err) = self.sync_pending().await {
                        warn!(error = %err, "sync after reconnect failed");
                    }
                }
                was_online = now_online;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClockKind;
    use chrono::TimeZone;

    fn event(local_id: &str, server_id: Option<ServerId>, minute: u32) -> ClockEvent {
        ClockEvent {
            local_id: local_id.to_string(),
            worker: 1,
            project: Some(1),
            kind: ClockKind::ClockIn,
            at: Utc.with_ymd_and_hms(2024, 9, 1, 4, minute, 0).unwrap(),
            location: None,
            server_id,
            synced: server_id.is_some(),
        }
    }

    #[test]
    fn confirmed_counterpart_replaces_pending_copy() {
        let local = vec![event("tmp-1", None, 0)];
        let remote = vec![event("tmp-1", Some(41), 0)];
        let merged = merge_histories(&local, &remote);
        assert_eq!(merged.events.len(), 1);
        assert_eq!(merged.events[0].server_id, Some(41));
        assert!(merged.events[0].synced);
        assert_eq!(merged.confirmed_local, 1);
        assert_eq!(merged.new_remote, 0);
    }

    #[test]
    fn server_id_matches_before_local_id() {
        let local = vec![event("device-a", Some(7), 0)];
        // Same server record re-exported under another temporary id.
        let remote = vec![event("export-7", Some(7), 0), event("other", Some(8), 5)];
        let merged = merge_histories(&local, &remote);
        assert_eq!(merged.events.len(), 2);
        assert_eq!(merged.events[0].local_id, "device-a");
        assert_eq!(merged.new_remote, 1);
        assert_eq!(merged.duplicates_skipped, 1);
    }

    #[test]
    fn merge_output_is_time_ordered() {
        let local = vec![event("b", None, 30)];
        let remote = vec![event("a", Some(1), 10), event("c", Some(2), 50)];
        let ids: Vec<String> = merge_histories(&local, &remote)
            .events
            .into_iter()
            .map(|e| e.local_id)
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }
}
