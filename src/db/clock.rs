/// Local clock-event queue. Rows are written pending and only ever move to
/// synced; nothing here deletes an event.
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::db::{parse_datetime, parse_enum, parse_optional_datetime};
use crate::error::Result;
use crate::types::{ClockEvent, Location, ServerId, WorkerId};

const EVENT_COLUMNS: &str = "local_id, server_id, worker_id, project_id, kind, at, \
                             latitude, longitude, accuracy_m, address, synced";

pub(crate) fn location_from_row(row: &Row<'_>, first: usize) -> rusqlite::Result<Option<Location>> {
    let latitude: Option<f64> = row.get(first)?;
    let longitude: Option<f64> = row.get(first + 1)?;
    Ok(match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Some(Location {
            latitude,
            longitude,
            accuracy_m: row.get(first + 2)?,
            address: row.get(first + 3)?,
        }),
        _ => None,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<ClockEvent> {
    Ok(ClockEvent {
        local_id: row.get(0)?,
        server_id: row.get(1)?,
        worker: row.get(2)?,
        project: row.get(3)?,
        kind: parse_enum(4, row.get(4)?)?,
        at: parse_datetime(5, row.get(5)?)?,
        location: location_from_row(row, 6)?,
        synced: row.get(10)?,
    })
}

/// Inserts or refreshes the local copy of an event, keyed by local id.
///
/// A row that is already synced keeps its server id; a pending row adopts
/// the incoming confirmation.
pub fn store_clock_event(event: &ClockEvent, owner: WorkerId, conn: &Connection) -> Result<()> {
    let location = event.location.as_ref();
    conn.execute(
        "INSERT INTO clock_events
            (local_id, server_id, owner, worker_id, project_id, kind, at,
             latitude, longitude, accuracy_m, address, synced)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT (local_id) DO UPDATE SET
            server_id = COALESCE(clock_events.server_id, excluded.server_id),
            synced = MAX(clock_events.synced, excluded.synced)",
        params![
            event.local_id,
            event.server_id,
            owner,
            event.worker,
            event.project,
            event.kind.as_str(),
            event.at.to_rfc3339(),
            location.map(|l| l.latitude),
            location.map(|l| l.longitude),
            location.and_then(|l| l.accuracy_m),
            location.and_then(|l| l.address.clone()),
            event.synced,
        ],
    )?;
    Ok(())
}

pub fn mark_synced(local_id: &str, server_id: ServerId, conn: &Connection) -> Result<()> {
    conn.execute(
        "UPDATE clock_events SET server_id = ?1, synced = 1 WHERE local_id = ?2 AND synced = 0",
        params![server_id, local_id],
    )?;
    Ok(())
}

pub fn query_clock_event(local_id: &str, conn: &Connection) -> Result<Option<ClockEvent>> {
    let event = conn
        .query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM clock_events WHERE local_id = ?1"),
            [local_id],
            event_from_row,
        )
        .optional()?;
    Ok(event)
}

/// Pending events created by `owner`, oldest first.
pub fn query_pending_events(owner: WorkerId, conn: &Connection) -> Result<Vec<ClockEvent>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM clock_events WHERE synced = 0 AND owner = ?1 ORDER BY at, local_id"
    ))?;
    let events = stmt
        .query_map([owner], event_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}

pub fn query_clock_events(worker: Option<WorkerId>, conn: &Connection) -> Result<Vec<ClockEvent>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM clock_events
         WHERE ?1 IS NULL OR worker_id = ?1 ORDER BY at, local_id"
    ))?;
    let events = stmt
        .query_map([worker], event_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}

/// Time of the newest confirmed event, optionally for one worker.
pub fn query_latest_confirmed_at(worker: Option<WorkerId>, conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = conn.query_row(
        "SELECT MAX(at) FROM clock_events WHERE synced = 1 AND (?1 IS NULL OR worker_id = ?1)",
        [worker],
        |row| row.get(0),
    )?;
    Ok(parse_optional_datetime(0, raw)?)
}
