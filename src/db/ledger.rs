/// Authoritative ledger queries. Submissions are keyed by the client's local
/// id so a retried submission resolves to the row written the first time.
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use crate::db::clock::location_from_row;
use crate::db::{parse_datetime, parse_enum};
use crate::error::Result;
use crate::types::{ClockEvent, ServerId, WorkerId};

/// Records `event` and returns its server id, together with whether this
/// call created the row.
pub fn insert_ledger_event(
    event: &ClockEvent,
    received_at: DateTime<Utc>,
    conn: &Connection,
) -> Result<(ServerId, bool)> {
    let location = event.location.as_ref();
    let inserted = conn.execute(
        "INSERT INTO ledger_events
            (client_ref, worker_id, project_id, kind, at,
             latitude, longitude, accuracy_m, address, received_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT (client_ref) DO NOTHING",
        params![
            event.local_id,
            event.worker,
            event.project,
            event.kind.as_str(),
            event.at.to_rfc3339(),
            location.map(|l| l.latitude),
            location.map(|l| l.longitude),
            location.and_then(|l| l.accuracy_m),
            location.and_then(|l| l.address.clone()),
            received_at.to_rfc3339(),
        ],
    )?;
    let server_id = conn.query_row(
        "SELECT server_id FROM ledger_events WHERE client_ref = ?1",
        [&event.local_id],
        |row| row.get(0),
    )?;
    Ok((server_id, inserted == 1))
}

/// Events at or after `since`, optionally for one worker, ordered by time.
pub fn query_ledger_events(
    worker: Option<WorkerId>,
    since: Option<DateTime<Utc>>,
    conn: &Connection,
) -> Result<Vec<ClockEvent>> {
    let mut stmt = conn.prepare(
        "SELECT client_ref, server_id, worker_id, project_id, kind, at,
                latitude, longitude, accuracy_m, address
         FROM ledger_events
         WHERE (?1 IS NULL OR worker_id = ?1) AND (?2 IS NULL OR at >= ?2)
         ORDER BY at, server_id",
    )?;
    let events = stmt
        .query_map(params![worker, since.map(|dt| dt.to_rfc3339())], |row| {
            Ok(ClockEvent {
                local_id: row.get(0)?,
                server_id: Some(row.get(1)?),
                worker: row.get(2)?,
                project: row.get(3)?,
                kind: parse_enum(4, row.get(4)?)?,
                at: parse_datetime(5, row.get(5)?)?,
                location: location_from_row(row, 6)?,
                synced: true,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}
