/// Database migrations and schema management.
use rusqlite::Connection;

use crate::error::Result;

/// Creates the schema if it doesn't exist yet.
///
/// The project tree, snapshots, the local clock queue and the authoritative
/// ledger share one schema; a device database simply leaves `ledger_events`
/// empty and the ledger database leaves the queue empty.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS projects (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            name           TEXT    NOT NULL UNIQUE,
            progress       INTEGER NOT NULL DEFAULT 0,
            status         TEXT    NOT NULL DEFAULT 'active',
            closing_budget REAL,
            created_at     TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id   INTEGER NOT NULL,
            position     INTEGER NOT NULL,
            title        TEXT    NOT NULL,
            completed    INTEGER NOT NULL DEFAULT 0,
            completed_at TEXT,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS milestones (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id      INTEGER NOT NULL,
            position     INTEGER NOT NULL,
            title        TEXT    NOT NULL,
            completed    INTEGER NOT NULL DEFAULT 0,
            completed_at TEXT,
            FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS workers (
            id   INTEGER PRIMARY KEY,
            name TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS task_workers (
            task_id   INTEGER NOT NULL,
            worker_id INTEGER NOT NULL,
            PRIMARY KEY (task_id, worker_id),
            FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS snapshots (
            project_id  INTEGER NOT NULL,
            day         TEXT    NOT NULL,
            progress    INTEGER NOT NULL,
            note        TEXT    NOT NULL,
            recorded_at TEXT    NOT NULL,
            UNIQUE (project_id, day)
        );

        CREATE TABLE IF NOT EXISTS clock_events (
            local_id    TEXT    PRIMARY KEY,
            server_id   INTEGER UNIQUE,
            owner       INTEGER NOT NULL,
            worker_id   INTEGER NOT NULL,
            project_id  INTEGER,
            kind        TEXT    NOT NULL,
            at          TEXT    NOT NULL,
            latitude    REAL,
            longitude   REAL,
            accuracy_m  REAL,
            address     TEXT,
            synced      INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS clock_events_pending ON clock_events (synced, owner);

        CREATE TABLE IF NOT EXISTS ledger_events (
            server_id   INTEGER PRIMARY KEY AUTOINCREMENT,
            client_ref  TEXT    NOT NULL UNIQUE,
            worker_id   INTEGER NOT NULL,
            project_id  INTEGER,
            kind        TEXT    NOT NULL,
            at          TEXT    NOT NULL,
            latitude    REAL,
            longitude   REAL,
            accuracy_m  REAL,
            address     TEXT,
            received_at TEXT    NOT NULL
        );
        CREATE INDEX IF NOT EXISTS ledger_events_worker ON ledger_events (worker_id, at);
        ",
    )?;
    Ok(())
}
