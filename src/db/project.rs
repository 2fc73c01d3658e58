/// Project tree queries: projects, their tasks, milestones and assignments.
use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};

use crate::db::{parse_datetime, parse_enum, parse_optional_datetime};
use crate::error::{Error, Result};
use crate::types::{Milestone, MilestoneId, Project, ProjectId, Task, TaskId, WorkerId};

pub fn create_project(arg: &Project, conn: &Connection) -> Result<ProjectId> {
    conn.execute(
        "INSERT INTO projects (name, progress, status, closing_budget, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            arg.name,
            arg.progress,
            arg.status.as_str(),
            arg.closing_budget,
            arg.created_at.to_rfc3339()
        ],
    )?;
    Ok(conn.last_insert_rowid() as ProjectId)
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: Some(row.get(0)?),
        name: row.get(1)?,
        tasks: Vec::new(),
        progress: row.get(2)?,
        status: parse_enum(3, row.get(3)?)?,
        closing_budget: row.get(4)?,
        created_at: parse_datetime(5, row.get(5)?)?,
    })
}

const PROJECT_COLUMNS: &str = "id, name, progress, status, closing_budget, created_at";

pub fn query_project_ids(conn: &Connection) -> Result<Vec<ProjectId>> {
    let mut stmt = conn.prepare("SELECT id FROM projects ORDER BY id")?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<ProjectId>>>()?;
    Ok(ids)
}

pub fn query_projects(conn: &Connection) -> Result<Vec<Project>> {
    let mut stmt = conn.prepare(&format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY id"))?;
    let mut projects = stmt
        .query_map([], project_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for project in &mut projects {
        if let Some(id) = project.id {
            project.tasks = query_tasks(id, conn)?;
        }
    }
    Ok(projects)
}

pub fn query_project_by_id(id: ProjectId, conn: &Connection) -> Result<Option<Project>> {
    let project = conn
        .query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
            [id],
            project_from_row,
        )
        .optional()?;
    match project {
        Some(mut project) => {
            project.tasks = query_tasks(id, conn)?;
            Ok(Some(project))
        }
        None => Ok(None),
    }
}

pub fn query_project_by_name(name: &str, conn: &Connection) -> Result<Option<Project>> {
    let id: Option<ProjectId> = conn
        .query_row("SELECT id FROM projects WHERE name = ?1", [name], |row| row.get(0))
        .optional()?;
    match id {
        Some(id) => query_project_by_id(id, conn),
        None => Ok(None),
    }
}

fn query_tasks(project_id: ProjectId, conn: &Connection) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, completed, completed_at FROM tasks
         WHERE project_id = ?1 ORDER BY position, id",
    )?;
    let mut tasks = stmt
        .query_map([project_id], |row| {
            Ok(Task {
                id: Some(row.get(0)?),
                title: row.get(1)?,
                milestones: Vec::new(),
                completed: row.get(2)?,
                completed_at: parse_optional_datetime(3, row.get(3)?)?,
                assigned_workers: BTreeSet::new(),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for task in &mut tasks {
        if let Some(id) = task.id {
            task.milestones = query_milestones(id, conn)?;
            task.assigned_workers = query_assigned_workers(id, conn)?;
        }
    }
    Ok(tasks)
}

fn query_milestones(task_id: TaskId, conn: &Connection) -> Result<Vec<Milestone>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, completed, completed_at FROM milestones
         WHERE task_id = ?1 ORDER BY position, id",
    )?;
    let milestones = stmt
        .query_map([task_id], |row| {
            Ok(Milestone {
                id: Some(row.get(0)?),
                title: row.get(1)?,
                completed: row.get(2)?,
                completed_at: parse_optional_datetime(3, row.get(3)?)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(milestones)
}

fn query_assigned_workers(task_id: TaskId, conn: &Connection) -> Result<BTreeSet<WorkerId>> {
    let mut stmt = conn.prepare("SELECT worker_id FROM task_workers WHERE task_id = ?1")?;
    let workers = stmt
        .query_map([task_id], |row| row.get(0))?
        .collect::<rusqlite::Result<BTreeSet<WorkerId>>>()?;
    Ok(workers)
}

pub fn add_task(project_id: ProjectId, position: usize, task: &Task, conn: &Connection) -> Result<TaskId> {
    conn.execute(
        "INSERT INTO tasks (project_id, position, title, completed, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            project_id,
            position as i64,
            task.title,
            task.completed,
            task.completed_at.map(|dt| dt.to_rfc3339())
        ],
    )?;
    Ok(conn.last_insert_rowid() as TaskId)
}

pub fn add_milestone(
    task_id: TaskId,
    position: usize,
    milestone: &Milestone,
    conn: &Connection,
) -> Result<MilestoneId> {
    conn.execute(
        "INSERT INTO milestones (task_id, position, title, completed, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            task_id,
            position as i64,
            milestone.title,
            milestone.completed,
            milestone.completed_at.map(|dt| dt.to_rfc3339())
        ],
    )?;
    Ok(conn.last_insert_rowid() as MilestoneId)
}

pub fn assign_worker(task_id: TaskId, worker_id: WorkerId, conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO task_workers (task_id, worker_id) VALUES (?1, ?2)",
        params![task_id, worker_id],
    )?;
    Ok(())
}

/// Persists the whole tree in one transaction. Tasks and milestones without
/// an id are inserted and receive their new ids.
pub fn write_project(project: &mut Project, conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    write_tree(project, &tx)?;
    tx.commit()?;
    Ok(())
}

/// Loads a project, applies `apply` and writes the tree back, all inside one
/// immediate transaction so no other writer can commit in between. Nothing
/// is written when `apply` fails. Returns `None` for an unknown project.
pub fn update_project<T>(
    id: ProjectId,
    conn: &Connection,
    apply: impl FnOnce(&mut Project) -> Result<T>,
) -> Result<Option<(Project, T)>> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let Some(mut project) = query_project_by_id(id, &tx)? else {
        return Ok(None);
    };
    let out = apply(&mut project)?;
    write_tree(&mut project, &tx)?;
    tx.commit()?;
    Ok(Some((project, out)))
}

fn write_tree(project: &mut Project, tx: &Connection) -> Result<()> {
    let project_id = project
        .id
        .ok_or_else(|| Error::Validation("cannot write a project that was never created".into()))?;
    let updated = tx.execute(
        "UPDATE projects SET name = ?1, progress = ?2, status = ?3, closing_budget = ?4 WHERE id = ?5",
        params![
            project.name,
            project.progress,
            project.status.as_str(),
            project.closing_budget,
            project_id
        ],
    )?;
    if updated == 0 {
        return Err(Error::not_found("project", project_id));
    }

    for (position, task) in project.tasks.iter_mut().enumerate() {
        let task_id = match task.id {
            Some(id) => {
                tx.execute(
                    "UPDATE tasks SET position = ?1, title = ?2, completed = ?3, completed_at = ?4
                     WHERE id = ?5 AND project_id = ?6",
                    params![
                        position as i64,
                        task.title,
                        task.completed,
                        task.completed_at.map(|dt| dt.to_rfc3339()),
                        id,
                        project_id
                    ],
                )?;
                id
            }
            None => {
                let id = add_task(project_id, position, task, &tx)?;
                task.id = Some(id);
                id
            }
        };
        for worker in &task.assigned_workers {
            assign_worker(task_id, *worker, &tx)?;
        }
        for (position, milestone) in task.milestones.iter_mut().enumerate() {
            match milestone.id {
                Some(id) => {
                    tx.execute(
                        "UPDATE milestones SET position = ?1, title = ?2, completed = ?3, completed_at = ?4
                         WHERE id = ?5 AND task_id = ?6",
                        params![
                            position as i64,
                            milestone.title,
                            milestone.completed,
                            milestone.completed_at.map(|dt| dt.to_rfc3339()),
                            id,
                            task_id
                        ],
                    )?;
                }
                None => milestone.id = Some(add_milestone(task_id, position, milestone, &tx)?),
            }
        }
    }
    tracing::debug!(project = project_id, "project tree written");
    Ok(())
}
