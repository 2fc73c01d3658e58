//! Hierarchical progress roll-up.
//!
//! Milestones are binary. A task's progress is the share of its completed
//! milestones; a project's progress is the rounded mean of its tasks, where a
//! task without milestones counts as 0%. Every mutation in this module ends
//! with [`recompute`] so derived fields never drift from milestone state.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{Milestone, MilestoneId, Project, ProjectStatus, Task, TaskId};

/// Progress and status of a project before and after a recompute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressChange {
    pub previous_progress: u8,
    pub progress: u8,
    pub previous_status: ProjectStatus,
    pub status: ProjectStatus,
}

impl ProgressChange {
    pub fn changed(&self) -> bool {
        self.previous_progress != self.progress || self.previous_status != self.status
    }
}

/// Rounded percentage of `completed` out of `total`; 0 when `total` is 0.
fn percent(completed: usize, total: usize) -> u8 {
    assert!(
        completed <= total,
        "completed count {completed} exceeds total {total}"
    );
    if total == 0 {
        return 0;
    }
    (100.0 * completed as f64 / total as f64).round() as u8
}

pub fn task_progress(task: &Task) -> u8 {
    percent(task.completed_milestones(), task.milestones.len())
}

pub fn project_progress(project: &Project) -> u8 {
    if project.tasks.is_empty() {
        return 0;
    }
    let sum: u32 = project.tasks.iter().map(|t| u32::from(task_progress(t))).sum();
    (f64::from(sum) / project.tasks.len() as f64).round() as u8
}

/// Re-derives milestone, task and project fields from milestone completion.
pub fn recompute(project: &mut Project) -> ProgressChange {
    let previous_progress = project.progress;
    let previous_status = project.status;

    for task in &mut project.tasks {
        for milestone in &mut task.milestones {
            repair_milestone(milestone);
        }
        derive_task_completion(task);
    }

    project.progress = project_progress(project);
    project.status = match project.status {
        ProjectStatus::Hold => ProjectStatus::Hold,
        _ if project.progress == 100 => ProjectStatus::Completed,
        _ => ProjectStatus::Active,
    };

    let change = ProgressChange {
        previous_progress,
        progress: project.progress,
        previous_status,
        status: project.status,
    };
    if change.changed() {
        debug!(
            project = ?project.id,
            from = previous_progress,
            to = project.progress,
            status = %project.status,
            "project progress recomputed"
        );
    }
    change
}

fn repair_milestone(milestone: &mut Milestone) {
    match (milestone.completed, milestone.completed_at) {
        (false, Some(_)) => {
            warn!(milestone = ?milestone.id, "invariant violation: open milestone carries completed_at, clearing");
            milestone.completed_at = None;
        }
        (true, None) => {
            // Without a timestamp the milestone cannot be ordered; treat it as open.
            warn!(milestone = ?milestone.id, "invariant violation: completed milestone without completed_at, reopening");
            milestone.completed = false;
        }
        _ => {}
    }
}

fn derive_task_completion(task: &mut Task) {
    let all_done = !task.milestones.is_empty() && task.milestones.iter().all(|m| m.completed);
    if task.completed && task.milestones.is_empty() {
        warn!(task = ?task.id, "invariant violation: task marked completed without milestones, coercing to open");
    }
    task.completed = all_done;
    task.completed_at = if all_done {
        task.milestones.iter().filter_map(|m| m.completed_at).max()
    } else {
        None
    };
}

fn task_mut(project: &mut Project, task_id: TaskId) -> Result<&mut Task> {
    project
        .task_mut(task_id)
        .ok_or_else(|| Error::not_found("task", task_id))
}

pub fn set_milestone_completed(
    project: &mut Project,
    task_id: TaskId,
    milestone_id: MilestoneId,
    completed: bool,
    at: DateTime<Utc>,
) -> Result<ProgressChange> {
    let task = task_mut(project, task_id)?;
    let milestone = task
        .milestones
        .iter_mut()
        .find(|m| m.id == Some(milestone_id))
        .ok_or_else(|| Error::not_found("milestone", milestone_id))?;
    if milestone.completed != completed {
        milestone.completed = completed;
        milestone.completed_at = completed.then_some(at);
    }
    Ok(recompute(project))
}

pub fn add_task(project: &mut Project, task: Task) -> ProgressChange {
    project.tasks.push(task);
    recompute(project)
}

pub fn add_milestone(
    project: &mut Project,
    task_id: TaskId,
    milestone: Milestone,
) -> Result<ProgressChange> {
    task_mut(project, task_id)?.milestones.push(milestone);
    Ok(recompute(project))
}

/// Puts a project on hold, or releases it back to progress-driven status.
pub fn set_hold(project: &mut Project, hold: bool) -> ProgressChange {
    project.status = if hold {
        ProjectStatus::Hold
    } else {
        ProjectStatus::Active
    };
    recompute(project)
}

pub fn set_closing_budget(project: &mut Project, amount: f64) -> Result<()> {
    if project_progress(project) < 100 {
        return Err(Error::Validation(format!(
            "closing budget requires 100% progress, project is at {}%",
            project_progress(project)
        )));
    }
    if !amount.is_finite() || amount < 0.0 {
        return Err(Error::Validation(format!("closing budget {amount} is not a valid amount")));
    }
    project.closing_budget = Some(amount);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 10, hour, 0, 0).unwrap()
    }

    fn milestone(id: MilestoneId, done_at: Option<DateTime<Utc>>) -> Milestone {
        Milestone {
            id: Some(id),
            title: format!("m{id}"),
            completed: done_at.is_some(),
            completed_at: done_at,
        }
    }

    fn task(id: TaskId, milestones: Vec<Milestone>) -> Task {
        Task {
            id: Some(id),
            milestones,
            ..Task::new(format!("t{id}"))
        }
    }

    fn project(tasks: Vec<Task>) -> Project {
        let mut p = Project::new("Tower B", at(0));
        p.id = Some(1);
        p.tasks = tasks;
        recompute(&mut p);
        p
    }

    #[test]
    fn task_progress_rounds_share_of_completed_milestones() {
        let t = task(1, vec![milestone(1, Some(at(1))), milestone(2, None), milestone(3, None)]);
        assert_eq!(task_progress(&t), 33);
        let t = task(1, vec![milestone(1, Some(at(1))), milestone(2, Some(at(2))), milestone(3, None)]);
        assert_eq!(task_progress(&t), 67);
        assert_eq!(task_progress(&task(1, vec![])), 0);
    }

    #[test]
    fn zero_milestone_task_contributes_zero() {
        let p = project(vec![
            task(1, vec![]),
            task(2, vec![milestone(1, Some(at(3)))]),
        ]);
        assert_eq!(p.progress, 50);
        assert_eq!(p.status, ProjectStatus::Active);
    }

    #[test]
    fn empty_project_is_zero() {
        assert_eq!(project(vec![]).progress, 0);
    }

    #[test]
    fn task_completion_tracks_last_milestone() {
        let mut p = project(vec![task(1, vec![milestone(1, Some(at(5))), milestone(2, None)])]);
        assert!(!p.tasks[0].completed);
        assert_eq!(p.tasks[0].completed_at, None);

        set_milestone_completed(&mut p, 1, 2, true, at(9)).unwrap();
        assert!(p.tasks[0].completed);
        assert_eq!(p.tasks[0].completed_at, Some(at(9)));
        assert_eq!(p.progress, 100);
        assert_eq!(p.status, ProjectStatus::Completed);
    }

    #[test]
    fn adding_incomplete_milestone_reverts_completed_project() {
        let mut p = project(vec![task(1, vec![milestone(1, Some(at(1)))])]);
        assert_eq!(p.status, ProjectStatus::Completed);

        let change = add_milestone(&mut p, 1, Milestone::new("snag list")).unwrap();
        assert_eq!(change.previous_status, ProjectStatus::Completed);
        assert_eq!(p.status, ProjectStatus::Active);
        assert_eq!(p.progress, 50);
        assert!(!p.tasks[0].completed);
    }

    #[test]
    fn hold_is_never_overridden_by_progress() {
        let mut p = project(vec![task(1, vec![milestone(1, None)])]);
        set_hold(&mut p, true);
        set_milestone_completed(&mut p, 1, 1, true, at(4)).unwrap();
        assert_eq!(p.progress, 100);
        assert_eq!(p.status, ProjectStatus::Hold);

        set_hold(&mut p, false);
        assert_eq!(p.status, ProjectStatus::Completed);
    }

    #[test]
    fn completed_flag_without_milestones_is_coerced() {
        let mut t = task(1, vec![]);
        t.completed = true;
        t.completed_at = Some(at(2));
        let p = project(vec![t]);
        assert!(!p.tasks[0].completed);
        assert_eq!(p.tasks[0].completed_at, None);
        assert_eq!(p.progress, 0);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let mut p = project(vec![task(1, vec![milestone(1, None)])]);
        assert!(matches!(
            set_milestone_completed(&mut p, 9, 1, true, at(1)),
            Err(Error::NotFound { kind: "task", .. })
        ));
        assert!(matches!(
            set_milestone_completed(&mut p, 1, 9, true, at(1)),
            Err(Error::NotFound { kind: "milestone", .. })
        ));
    }

    #[test]
    fn closing_budget_requires_full_progress() {
        let mut p = project(vec![task(1, vec![milestone(1, None)])]);
        assert!(matches!(set_closing_budget(&mut p, 1200.0), Err(Error::Validation(_))));
        set_milestone_completed(&mut p, 1, 1, true, at(1)).unwrap();
        set_closing_budget(&mut p, 1200.0).unwrap();
        assert_eq!(p.closing_budget, Some(1200.0));
    }

    #[test]
    #[should_panic(expected = "exceeds total")]
    fn malformed_counts_fail_fast() {
        percent(3, 2);
    }

    prop_compose! {
        fn arb_project()(shape in prop::collection::vec(prop::collection::vec(any::<bool>(), 0..6), 0..6)) -> Project {
            let mut next_id = 0;
            let tasks = shape
                .into_iter()
                .enumerate()
                .map(|(ti, flags)| {
                    let milestones = flags
                        .into_iter()
                        .map(|done| {
                            next_id += 1;
                            milestone(next_id, done.then(|| at(1) + Duration::minutes(i64::from(next_id))))
                        })
                        .collect();
                    task(ti as TaskId + 1, milestones)
                })
                .collect();
            project(tasks)
        }
    }

    proptest! {
        #[test]
        fn completing_a_milestone_never_lowers_progress(p in arb_project(), pick in any::<prop::sample::Index>()) {
            let open: Vec<(TaskId, MilestoneId)> = p
                .tasks
                .iter()
                .flat_map(|t| t.milestones.iter().filter(|m| !m.completed).map(move |m| (t.id.unwrap(), m.id.unwrap())))
                .collect();
            prop_assume!(!open.is_empty());
            let (task_id, milestone_id) = open[pick.index(open.len())];
            let before_task = task_progress(p.tasks.iter().find(|t| t.id == Some(task_id)).unwrap());
            let mut after = p.clone();
            set_milestone_completed(&mut after, task_id, milestone_id, true, at(20)).unwrap();
            let after_task = task_progress(after.tasks.iter().find(|t| t.id == Some(task_id)).unwrap());
            prop_assert!(after_task >= before_task);
            prop_assert!(after.progress >= p.progress);
        }

        #[test]
        fn reopening_a_milestone_never_raises_progress(p in arb_project(), pick in any::<prop::sample::Index>()) {
            let done: Vec<(TaskId, MilestoneId)> = p
                .tasks
                .iter()
                .flat_map(|t| t.milestones.iter().filter(|m| m.completed).map(move |m| (t.id.unwrap(), m.id.unwrap())))
                .collect();
            prop_assume!(!done.is_empty());
            let (task_id, milestone_id) = done[pick.index(done.len())];
            let before_task = task_progress(p.tasks.iter().find(|t| t.id == Some(task_id)).unwrap());
            let mut after = p.clone();
            set_milestone_completed(&mut after, task_id, milestone_id, false, at(20)).unwrap();
            let after_task = task_progress(after.tasks.iter().find(|t| t.id == Some(task_id)).unwrap());
            prop_assert!(after_task <= before_task);
            prop_assert!(after.progress <= p.progress);
        }

        #[test]
        fn task_completed_iff_all_milestones_done(p in arb_project()) {
            for t in &p.tasks {
                let expected = !t.milestones.is_empty() && t.milestones.iter().all(|m| m.completed);
                prop_assert_eq!(t.completed, expected);
                let latest = t.milestones.iter().filter_map(|m| m.completed_at).max();
                prop_assert_eq!(t.completed_at, if expected { latest } else { None });
            }
        }
    }
}
