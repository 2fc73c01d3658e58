/// Snapshot queries: one progress entry per project per calendar day.
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};

use crate::db::{parse_datetime, parse_day};
use crate::error::Result;
use crate::types::{ProjectId, SnapshotEntry};

/// How an upsert treats an entry that already exists for the day.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotMode {
    /// First write of the day wins; later writes are no-ops.
    Sweep,
    /// Administrative correction: overwrite the day's entry.
    Correction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    AlreadyPresent,
}

fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// Writes the entry for `(entry.project_id, entry.day)`.
///
/// Sweep mode is a single conditional insert against the
/// `UNIQUE (project_id, day)` constraint; correction mode checks and writes
/// inside one immediate transaction. Either way the check and the write
/// cannot interleave with another writer of the same day.
pub fn upsert_snapshot(entry: &SnapshotEntry, mode: SnapshotMode, conn: &Connection) -> Result<UpsertOutcome> {
    let day = day_key(entry.day);
    let recorded_at = entry.recorded_at.to_rfc3339();
    match mode {
        SnapshotMode::Sweep => {
            let inserted = conn.execute(
                "INSERT INTO snapshots (project_id, day, progress, note, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (project_id, day) DO NOTHING",
                params![entry.project_id, day, entry.progress, entry.note, recorded_at],
            )?;
            Ok(if inserted == 1 {
                UpsertOutcome::Created
            } else {
                UpsertOutcome::AlreadyPresent
            })
        }
        SnapshotMode::Correction => {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            let existed = tx
                .query_row(
                    "SELECT 1 FROM snapshots WHERE project_id = ?1 AND day = ?2",
                    params![entry.project_id, day],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            tx.execute(
                "INSERT INTO snapshots (project_id, day, progress, note, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (project_id, day) DO UPDATE SET
                    progress = excluded.progress,
                    note = excluded.note,
                    recorded_at = excluded.recorded_at",
                params![entry.project_id, day, entry.progress, entry.note, recorded_at],
            )?;
            tx.commit()?;
            Ok(if existed {
                UpsertOutcome::Updated
            } else {
                UpsertOutcome::Created
            })
        }
    }
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<SnapshotEntry> {
    Ok(SnapshotEntry {
        project_id: row.get(0)?,
        day: parse_day(1, row.get(1)?)?,
        progress: row.get(2)?,
        note: row.get(3)?,
        recorded_at: parse_datetime(4, row.get(4)?)?,
    })
}

pub fn query_snapshot(project_id: ProjectId, day: NaiveDate, conn: &Connection) -> Result<Option<SnapshotEntry>> {
    let entry = conn
        .query_row(
            "SELECT project_id, day, progress, note, recorded_at FROM snapshots
             WHERE project_id = ?1 AND day = ?2",
            params![project_id, day_key(day)],
            snapshot_from_row,
        )
        .optional()?;
    Ok(entry)
}

pub fn query_snapshots_for_project(project_id: ProjectId, conn: &Connection) -> Result<Vec<SnapshotEntry>> {
    let mut stmt = conn.prepare(
        "SELECT project_id, day, progress, note, recorded_at FROM snapshots
         WHERE project_id = ?1 ORDER BY day",
    )?;
    let entries = stmt
        .query_map([project_id], snapshot_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use chrono::{TimeZone, Utc};

    fn entry(progress: u8, note: &str) -> SnapshotEntry {
        SnapshotEntry {
            project_id: 3,
            day: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            progress,
            note: note.to_string(),
            recorded_at: Utc.with_ymd_and_hms(2024, 6, 1, 18, 29, 0).unwrap(),
        }
    }

    #[test]
    fn sweep_mode_keeps_first_write() {
        let conn = open_in_memory();
        assert_eq!(upsert_snapshot(&entry(40, "first"), SnapshotMode::Sweep, &conn).unwrap(), UpsertOutcome::Created);
        assert_eq!(
            upsert_snapshot(&entry(55, "second"), SnapshotMode::Sweep, &conn).unwrap(),
            UpsertOutcome::AlreadyPresent
        );
        let stored = query_snapshot(3, entry(0, "").day, &conn).unwrap().unwrap();
        assert_eq!(stored.progress, 40);
        assert_eq!(stored.note, "first");
    }

    #[test]
    fn correction_mode_overwrites_in_place() {
        let conn = open_in_memory();
        assert_eq!(
            upsert_snapshot(&entry(40, "auto"), SnapshotMode::Correction, &conn).unwrap(),
            UpsertOutcome::Created
        );
        assert_eq!(
            upsert_snapshot(&entry(45, "fixed"), SnapshotMode::Correction, &conn).unwrap(),
            UpsertOutcome::Updated
        );
        let all = query_snapshots_for_project(3, &conn).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].progress, 45);
    }
}
