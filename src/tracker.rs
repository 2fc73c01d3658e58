/// Project mutations. Every change loads the tree, applies the change through
/// the progress module and writes the recomputed tree back.
use std::sync::Arc;

use tracing::info;

use crate::clock::Clock;
use crate::db::{self, SharedConnection};
use crate::error::{Error, Result};
use crate::progress::{self, ProgressChange};
use crate::types::{Milestone, MilestoneId, Project, ProjectId, Task, TaskId, WorkerId, WorkerRecord};

pub struct ProjectTracker {
    conn: SharedConnection,
    clock: Arc<dyn Clock>,
}

impl ProjectTracker {
    pub fn new(conn: SharedConnection, clock: Arc<dyn Clock>) -> Self {
        Self { conn, clock }
    }

    pub fn create_project(&self, name: &str) -> Result<ProjectId> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("project name is empty".into()));
        }
        let conn = self.conn.lock();
        if db::query_project_by_name(name, &conn)?.is_some() {
            return Err(Error::Validation(format!("project '{name}' already exists")));
        }
        let id = db::create_project(&Project::new(name, self.clock.now()), &conn)?;
        info!(project = id, name, "project created");
        Ok(id)
    }

    pub fn project(&self, id: ProjectId) -> Result<Project> {
        db::query_project_by_id(id, &self.conn.lock())?.ok_or_else(|| Error::not_found("project", id))
    }

    pub fn project_by_name(&self, name: &str) -> Result<Project> {
        db::query_project_by_name(name, &self.conn.lock())?.ok_or_else(|| Error::not_found("project", name))
    }

    pub fn projects(&self) -> Result<Vec<Project>> {
        db::query_projects(&self.conn.lock())
    }

    fn update<T>(&self, id: ProjectId, apply: impl FnOnce(&mut Project) -> Result<T>) -> Result<(Project, T)> {
        db::update_project(id, &self.conn.lock(), apply)?.ok_or_else(|| Error::not_found("project", id))
    }

    pub fn add_task(&self, project_id: ProjectId, title: &str) -> Result<TaskId> {
        let (project, _) = self.update(project_id, |p| Ok(progress::add_task(p, Task::new(title))))?;
        project
            .tasks
            .last()
            .and_then(|t| t.id)
            .ok_or_else(|| Error::InvariantViolation("inserted task has no id".into()))
    }

    pub fn add_milestone(&self, project_id: ProjectId, task_id: TaskId, title: &str) -> Result<MilestoneId> {
        let (project, _) = self.update(project_id, |p| progress::add_milestone(p, task_id, Milestone::new(title)))?;
        project
            .tasks
            .iter()
            .find(|t| t.id == Some(task_id))
            .and_then(|t| t.milestones.last())
            .and_then(|m| m.id)
            .ok_or_else(|| Error::InvariantViolation("inserted milestone has no id".into()))
    }

    pub fn set_milestone_completed(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
        milestone_id: MilestoneId,
        completed: bool,
    ) -> Result<ProgressChange> {
        let now = self.clock.now();
        let (_, change) = self.update(project_id, |p| {
            progress::set_milestone_completed(p, task_id, milestone_id, completed, now)
        })?;
        if change.changed() {
            info!(
                project = project_id,
                progress = change.progress,
                status = %change.status,
                "project progress changed"
            );
        }
        Ok(change)
    }

    pub fn set_hold(&self, project_id: ProjectId, hold: bool) -> Result<ProgressChange> {
        let (_, change) = self.update(project_id, |p| Ok(progress::set_hold(p, hold)))?;
        Ok(change)
    }

    pub fn set_closing_budget(&self, project_id: ProjectId, amount: f64) -> Result<()> {
        self.update(project_id, |p| progress::set_closing_budget(p, amount))?;
        Ok(())
    }

    pub fn assign_worker(&self, project_id: ProjectId, task_id: TaskId, worker: WorkerId) -> Result<()> {
        self.update(project_id, |p| {
            p.task_mut(task_id)
                .ok_or_else(|| Error::not_found("task", task_id))?
                .assigned_workers
                .insert(worker);
            Ok(())
        })?;
        Ok(())
    }

    pub fn register_worker(&self, worker: &WorkerRecord) -> Result<()> {
        db::upsert_worker(worker, &self.conn.lock())
    }

    pub fn worker_name(&self, id: WorkerId) -> Result<Option<String>> {
        db::query_worker_name(id, &self.conn.lock())
    }

    pub fn workers(&self) -> Result<Vec<WorkerRecord>> {
        db::query_workers(&self.conn.lock())
    }
}
