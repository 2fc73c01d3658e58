/// Database module with project, snapshot, clock and worker queries and migrations.
mod clock;
mod ledger;
mod migrations;
mod project;
mod snapshot;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use rusqlite::types::Type;

use crate::error::Result;

pub use clock::{
    mark_synced, query_clock_event, query_clock_events, query_latest_confirmed_at, query_pending_events,
    store_clock_event,
};
pub use ledger::{insert_ledger_event, query_ledger_events};
pub use project::{
    add_milestone, add_task, assign_worker, create_project, query_project_by_id,
    query_project_by_name, query_project_ids, query_projects, update_project, write_project,
};
pub use snapshot::{
    SnapshotMode, UpsertOutcome, query_snapshot, query_snapshots_for_project, upsert_snapshot,
};
pub use worker::{query_worker_name, query_workers, upsert_worker};

/// Connection handle shared between the scheduler, the reconciler and the CLI.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Opens (or creates) the SQLite database and runs migrations.
pub fn init(db_path: &str) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    migrations::run_migrations(&conn)?;
    Ok(conn)
}

pub fn shared(conn: Connection) -> SharedConnection {
    Arc::new(Mutex::new(conn))
}

/// Returns a path inside the user's data directory for `file_name`.
/// Falls back to the working directory when no data dir is found.
pub fn default_path(file_name: &str) -> PathBuf {
    if let Some(data_dir) = dirs::data_local_dir() {
        let app_dir = data_dir.join("sitelog");
        std::fs::create_dir_all(&app_dir).ok();
        app_dir.join(file_name)
    } else {
        PathBuf::from(file_name)
    }
}

pub(crate) fn parse_datetime(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

pub(crate) fn parse_optional_datetime(
    idx: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|raw| parse_datetime(idx, raw)).transpose()
}

pub(crate) fn parse_day(idx: usize, raw: String) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

pub(crate) fn parse_enum<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse::<T>().map_err(|msg| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
    })
}

#[cfg(test)]
pub(crate) fn open_in_memory() -> Connection {
    init(":memory:").unwrap()
}
