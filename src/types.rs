use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub type ProjectId = u32;
pub type TaskId = u32;
pub type MilestoneId = u32;
pub type WorkerId = u32;
pub type ServerId = i64;

/// Client-generated identifier of a clock event, stable across restarts.
pub type LocalId = String;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Milestone {
    pub id: Option<MilestoneId>,
    pub title: String,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Milestone {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            completed: false,
            completed_at: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    pub id: Option<TaskId>,
    pub title: String,
    pub milestones: Vec<Milestone>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_workers: BTreeSet<WorkerId>,
}

impl Task {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            milestones: Vec::new(),
            completed: false,
            completed_at: None,
            assigned_workers: BTreeSet::new(),
        }
    }

    pub fn completed_milestones(&self) -> usize {
        self.milestones.iter().filter(|m| m.completed).count()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Active,
    Hold,
    Completed,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Hold => "hold",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "hold" => Ok(Self::Hold),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown project status '{other}'")),
        }
    }
}

/// A project owns its tasks, which own their milestones.
#[derive(Clone, Debug, PartialEq)]
pub struct Project {
    pub id: Option<ProjectId>,
    pub name: String,
    pub tasks: Vec<Task>,
    pub progress: u8,
    pub status: ProjectStatus,
    pub closing_budget: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            name: name.into(),
            tasks: Vec::new(),
            progress: 0,
            status: ProjectStatus::Active,
            closing_budget: None,
            created_at,
        }
    }

    pub fn task_mut(&mut self, task_id: TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == Some(task_id))
    }
}

/// One recorded progress fact for a project on a calendar day.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub project_id: ProjectId,
    pub day: NaiveDate,
    pub progress: u8,
    pub note: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClockKind {
    ClockIn,
    ClockOut,
}

impl ClockKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClockIn => "clock-in",
            Self::ClockOut => "clock-out",
        }
    }
}

impl fmt::Display for ClockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ClockKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clock-in" | "in" => Ok(Self::ClockIn),
            "clock-out" | "out" => Ok(Self::ClockOut),
            other => Err(format!("unknown clock event type '{other}'")),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy_m: Option<f64>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub name: String,
}

/// Worker reference as it arrives from exported histories: either a bare id
/// or the embedded worker record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerRef {
    ById(WorkerId),
    Embedded(WorkerRecord),
}

impl WorkerRef {
    pub fn id(&self) -> WorkerId {
        match self {
            Self::ById(id) => *id,
            Self::Embedded(record) => record.id,
        }
    }
}

/// A clock event as the caller hands it to the ledger, before validation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewClockEvent {
    pub worker: Option<WorkerId>,
    pub project: Option<ProjectId>,
    pub kind: Option<ClockKind>,
    pub at: Option<DateTime<Utc>>,
    pub location: Option<Location>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClockEvent {
    pub local_id: LocalId,
    pub worker: WorkerId,
    pub project: Option<ProjectId>,
    pub kind: ClockKind,
    pub at: DateTime<Utc>,
    pub location: Option<Location>,
    pub server_id: Option<ServerId>,
    pub synced: bool,
}

impl ClockEvent {
    pub fn is_pending(&self) -> bool {
        !self.synced
    }

    /// Marks the event as acknowledged by the authoritative ledger.
    pub fn confirm(&mut self, server_id: ServerId) {
        self.server_id = Some(server_id);
        self.synced = true;
    }
}

/// Clock event shape used by history exports, where the worker may be
/// embedded rather than referenced.
#[derive(Clone, Debug, Deserialize)]
pub struct ExportedClockEvent {
    pub local_id: LocalId,
    pub worker: WorkerRef,
    #[serde(default)]
    pub project: Option<ProjectId>,
    #[serde(rename = "type")]
    pub kind: ClockKind,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub location: Option<Location>,
    pub server_id: ServerId,
}

impl ExportedClockEvent {
    /// Resolves the worker reference, returning the canonical event plus the
    /// embedded record when one was present.
    pub fn into_canonical(self) -> (ClockEvent, Option<WorkerRecord>) {
        let record = match &self.worker {
            WorkerRef::Embedded(record) => Some(record.clone()),
            WorkerRef::ById(_) => None,
        };
        let event = ClockEvent {
            local_id: self.local_id,
            worker: self.worker.id(),
            project: self.project,
            kind: self.kind,
            at: self.time,
            location: self.location,
            server_id: Some(self.server_id),
            synced: true,
        };
        (event, record)
    }
}
