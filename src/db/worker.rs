/// Worker directory queries. Only used to put names on reports.
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;
use crate::types::{WorkerId, WorkerRecord};

pub fn upsert_worker(worker: &WorkerRecord, conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT INTO workers (id, name) VALUES (?1, ?2)
         ON CONFLICT (id) DO UPDATE SET name = excluded.name",
        params![worker.id, worker.name],
    )?;
    Ok(())
}

pub fn query_worker_name(id: WorkerId, conn: &Connection) -> Result<Option<String>> {
    let name = conn
        .query_row("SELECT name FROM workers WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    Ok(name)
}

pub fn query_workers(conn: &Connection) -> Result<Vec<WorkerRecord>> {
    let mut stmt = conn.prepare("SELECT id, name FROM workers ORDER BY id")?;
    let workers = stmt
        .query_map([], |row| {
            Ok(WorkerRecord {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(workers)
}
