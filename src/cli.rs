/// CLI argument parsing and command handling.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::{DateTime, FixedOffset, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use sitelog::clock::{Clock, SystemClock};
use sitelog::config::Config;
use sitelog::db::{self, SharedConnection};
use sitelog::ledger::{ClockLedger, durations};
use sitelog::progress;
use sitelog::snapshot::Scheduler;
use sitelog::sync::{LocalLedgerTransport, Reconciler, SyncSummary};
use sitelog::tracker::ProjectTracker;
use sitelog::types::{
    ClockEvent, ClockKind, ExportedClockEvent, Location, NewClockEvent, Project, ProjectId,
    WorkerId, WorkerRecord,
};

#[derive(Parser)]
#[command(
    name = "sitelog",
    version,
    about = "Sitelog - construction progress snapshots and offline-first time clock"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Project {
        #[command(subcommand)]
        command: ProjectCommand,
    },
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    Milestone {
        #[command(subcommand)]
        command: MilestoneCommand,
    },
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
    Clock {
        #[command(subcommand)]
        command: ClockCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProjectCommand {
    Add { name: String },
    List,
    Show { project: String },
    Hold { project: String },
    Resume { project: String },
    Budget { project: String, amount: f64 },
}

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    Add { project: String, title: String },
    Assign { project: String, task: u32, worker: WorkerId },
}

#[derive(Subcommand, Debug)]
pub enum MilestoneCommand {
    Add { project: String, task: u32, title: String },
    Done { project: String, task: u32, milestone: u32 },
    Undo { project: String, task: u32, milestone: u32 },
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommand {
    Add { id: WorkerId, name: String },
    List,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommand {
    /// Run the daily sweep now.
    Run,
    /// Overwrite today's snapshot for a project.
    Set {
        project: String,
        progress: u8,
        #[arg(short = 'n', long = "note")]
        note: Option<String>,
    },
    History { project: String },
    /// Run the sweep every day at the configured time.
    Daemon,
}

#[derive(Subcommand, Debug)]
pub enum ClockCommand {
    In(ClockArgs),
    Out(ClockArgs),
    Sync,
    History {
        #[arg(short = 'w', long = "worker")]
        worker: Option<WorkerId>,
    },
    Report {
        #[arg(short = 'w', long = "worker")]
        worker: Option<WorkerId>,
    },
    /// Merge an exported ledger history (JSON array).
    Import { file: PathBuf },
}

#[derive(clap::Args, Debug)]
pub struct ClockArgs {
    project: String,
    #[arg(short = 'w', long = "worker")]
    worker: Option<WorkerId>,
    #[arg(short = 't', long = "time")]
    time: Option<String>,
    #[arg(long = "lat", requires = "lng")]
    lat: Option<f64>,
    #[arg(long = "lng", requires = "lat")]
    lng: Option<f64>,
    #[arg(long = "address")]
    address: Option<String>,
    /// Capture without attempting to transmit.
    #[arg(long = "offline")]
    offline: bool,
}

/// Everything a command needs, opened once per invocation.
pub struct Context {
    conn: SharedConnection,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
    config: Config,
    tracker: ProjectTracker,
    ledger: Arc<ClockLedger>,
}

impl Context {
    pub fn open(config: &Config) -> Result<Self> {
        let offset = config.snapshot.offset()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(offset));
        let conn = db::shared(
            db::init(&config.db_path.to_string_lossy())
                .with_context(|| format!("failed to open {}", config.db_path.display()))?,
        );
        let ledger_conn = db::shared(
            db::init(&config.ledger_path.to_string_lossy())
                .with_context(|| format!("failed to open {}", config.ledger_path.display()))?,
        );
        Ok(Self {
            tracker: ProjectTracker::new(conn.clone(), clock.clone()),
            ledger: Arc::new(ClockLedger::new(ledger_conn, clock.clone())),
            conn,
            clock,
            offset,
            config: config.clone(),
        })
    }

    fn scheduler(&self) -> Result<Scheduler> {
        Ok(Scheduler::new(
            self.conn.clone(),
            self.clock.clone(),
            self.config.snapshot.note.clone(),
            self.config.snapshot.sweep_time()?,
        ))
    }

    /// Reconciler for this device's queue. Every event captured here is
    /// owned by the device, whichever worker it records.
    fn reconciler(&self, online: bool) -> (Reconciler, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(online);
        let transport = Arc::new(LocalLedgerTransport::new(self.ledger.clone()));
        let reconciler = Reconciler::new(self.conn.clone(), transport, self.clock.clone(), self.device_owner(), rx);
        (reconciler, tx)
    }

    /// The configured session worker; 0 on a device without one.
    fn device_owner(&self) -> WorkerId {
        self.config.session.worker.unwrap_or_default()
    }

    fn session_worker(&self, explicit: Option<WorkerId>) -> Result<WorkerId> {
        explicit
            .or(self.config.session.worker)
            .context("no worker given; pass --worker or set [session] worker in config.toml")
    }

    fn project_id(&self, name: &str) -> Result<ProjectId> {
        let project = self.tracker.project_by_name(name)?;
        project.id.context("stored project has no id")
    }
}

/// Execute a CLI command.
pub async fn run(command: Command, ctx: &Context) -> Result<()> {
    match command {
        Command::Project { command } => handle_project(command, ctx)?,
        Command::Task { command } => handle_task(command, ctx)?,
        Command::Milestone { command } => handle_milestone(command, ctx)?,
        Command::Worker { command } => match command {
            WorkerCommand::Add { id, name } => {
                ctx.tracker.register_worker(&WorkerRecord { id, name })?;
            }
            WorkerCommand::List => {
                for worker in ctx.tracker.workers()? {
                    println!("{:>4}  {}", worker.id, worker.name);
                }
            }
        },
        Command::Snapshot { command } => handle_snapshot(command, ctx).await?,
        Command::Clock { command } => handle_clock(command, ctx).await?,
    }
    Ok(())
}

fn handle_project(command: ProjectCommand, ctx: &Context) -> Result<()> {
    match command {
        ProjectCommand::Add { name } => {
            let id = ctx.tracker.create_project(&name)?;
            println!("Created project '{name}' ({id})");
        }
        ProjectCommand::List => {
            for project in ctx.tracker.projects()? {
                println!(
                    "{:>4}  {:<30} {:>3}%  {}",
                    project.id.unwrap_or_default(),
                    project.name,
                    progress::project_progress(&project),
                    project.status
                );
            }
        }
        ProjectCommand::Show { project } => print_project(&ctx.tracker.project_by_name(&project)?),
        ProjectCommand::Hold { project } => {
            let change = ctx.tracker.set_hold(ctx.project_id(&project)?, true)?;
            println!("Project '{project}' is now {}", change.status);
        }
        ProjectCommand::Resume { project } => {
            let change = ctx.tracker.set_hold(ctx.project_id(&project)?, false)?;
            println!("Project '{project}' is now {}", change.status);
        }
        ProjectCommand::Budget { project, amount } => {
            ctx.tracker.set_closing_budget(ctx.project_id(&project)?, amount)?;
            println!("Closing budget for '{project}' set to {amount:.2}");
        }
    }
    Ok(())
}

fn print_project(project: &Project) {
    println!(
        "{} - {}% ({})",
        project.name,
        progress::project_progress(project),
        project.status
    );
    if let Some(budget) = project.closing_budget {
        println!("  closing budget: {budget:.2}");
    }
    for task in &project.tasks {
        let mark = if task.completed { "x" } else { " " };
        println!(
            "  [{mark}] #{} {} ({}%)",
            task.id.unwrap_or_default(),
            task.title,
            progress::task_progress(task)
        );
        for milestone in &task.milestones {
            let mark = if milestone.completed { "x" } else { " " };
            println!("      [{mark}] #{} {}", milestone.id.unwrap_or_default(), milestone.title);
        }
    }
}

fn handle_task(command: TaskCommand, ctx: &Context) -> Result<()> {
    match command {
        TaskCommand::Add { project, title } => {
            let id = ctx.tracker.add_task(ctx.project_id(&project)?, &title)?;
            println!("Added task #{id} to '{project}'");
        }
        TaskCommand::Assign { project, task, worker } => {
            ctx.tracker.assign_worker(ctx.project_id(&project)?, task, worker)?;
        }
    }
    Ok(())
}

fn handle_milestone(command: MilestoneCommand, ctx: &Context) -> Result<()> {
    let (project, task, milestone, done) = match command {
        MilestoneCommand::Add { project, task, title } => {
            let id = ctx.tracker.add_milestone(ctx.project_id(&project)?, task, &title)?;
            println!("Added milestone #{id} to task #{task}");
            return Ok(());
        }
        MilestoneCommand::Done { project, task, milestone } => (project, task, milestone, true),
        MilestoneCommand::Undo { project, task, milestone } => (project, task, milestone, false),
    };
    let change = ctx
        .tracker
        .set_milestone_completed(ctx.project_id(&project)?, task, milestone, done)?;
    println!(
        "'{project}' progress {}% -> {}% ({})",
        change.previous_progress, change.progress, change.status
    );
    Ok(())
}

async fn handle_snapshot(command: SnapshotCommand, ctx: &Context) -> Result<()> {
    let scheduler = ctx.scheduler()?;
    match command {
        SnapshotCommand::Run => {
            let summary = scheduler.run_daily_sweep().await?;
            println!(
                "{}: {} projects, {} written, {} already present, {} failed",
                summary.day,
                summary.attempted,
                summary.written,
                summary.skipped_already_present,
                summary.errors.len()
            );
            for (project, message) in summary.errors {
                println!("  project {project}: {message}");
            }
        }
        SnapshotCommand::Set { project, progress, note } => {
            let note = note.unwrap_or_else(|| "Manual correction".to_string());
            let outcome = scheduler.correct_today(ctx.project_id(&project)?, progress, &note)?;
            println!("Snapshot for '{project}': {outcome:?}");
        }
        SnapshotCommand::History { project } => {
            for entry in scheduler.history(ctx.project_id(&project)?)? {
                println!("{}  {:>3}%  {}", entry.day, entry.progress, entry.note);
            }
        }
        SnapshotCommand::Daemon => {
            let scheduler = Arc::new(scheduler);
            println!("Next sweep at {}", scheduler.next_run().with_timezone(&ctx.offset));
            let handle = scheduler.spawn_daily();
            tokio::select! {
                result = handle => result.context("snapshot scheduler stopped")?,
                result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
            }
        }
    }
    Ok(())
}

async fn handle_clock(command: ClockCommand, ctx: &Context) -> Result<()> {
    match command {
        ClockCommand::In(args) => clock_event(ClockKind::ClockIn, args, ctx).await?,
        ClockCommand::Out(args) => clock_event(ClockKind::ClockOut, args, ctx).await?,
        ClockCommand::Sync => {
            let (reconciler, _online) = ctx.reconciler(true);
            let summary = reconciler.sync_pending().await?;
            reconciler.refresh_recent(None).await?;
            println!(
                "Synced {}/{} pending events",
                summary.confirmed, summary.attempted
            );
            for (local_id, message) in summary.failed {
                println!("  {local_id} not yet synced: {message}");
            }
        }
        ClockCommand::History { worker } => {
            let (reconciler, _online) = ctx.reconciler(true);
            for event in reconciler.merged_history(worker)? {
                print_event(&event, ctx.offset);
            }
        }
        ClockCommand::Report { worker } => {
            let (reconciler, _online) = ctx.reconciler(true);
            let events = reconciler.merged_history(worker)?;
            for (worker_id, report) in durations(&events) {
                let name = ctx
                    .tracker
                    .worker_name(worker_id)?
                    .unwrap_or_else(|| format!("worker {worker_id}"));
                println!("{name}: {}", format_minutes(report.total_minutes));
                for (project, minutes) in &report.by_project {
                    let label = ctx
                        .tracker
                        .project(*project)
                        .map(|p| p.name)
                        .unwrap_or_else(|_| format!("project {project}"));
                    println!("  {label:<30} {}", format_minutes(*minutes));
                }
                if report.unattributed_minutes > 0 {
                    println!("  {:<30} {}", "(no project)", format_minutes(report.unattributed_minutes));
                }
            }
        }
        ClockCommand::Import { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let exported: Vec<ExportedClockEvent> = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", file.display()))?;
            let (reconciler, _online) = ctx.reconciler(false);
            let merged = reconciler.import(exported)?;
            println!(
                "Imported {} new events, confirmed {}, skipped {} duplicates",
                merged.new_remote, merged.confirmed_local, merged.duplicates_skipped
            );
        }
    }
    Ok(())
}

async fn clock_event(kind: ClockKind, args: ClockArgs, ctx: &Context) -> Result<()> {
    let worker = ctx.session_worker(args.worker)?;
    let location = match (args.lat, args.lng) {
        (Some(latitude), Some(longitude)) => Some(Location {
            latitude,
            longitude,
            accuracy_m: None,
            address: args.address,
        }),
        _ => None,
    };
    let draft = NewClockEvent {
        worker: Some(worker),
        project: Some(ctx.project_id(&args.project)?),
        kind: Some(kind),
        at: parse_optional_datetime(args.time)?,
        location,
    };
    let (reconciler, _online) = ctx.reconciler(!args.offline);
    let (event, summary) = reconciler.append_and_sync(draft).await?;
    print_event(&event, ctx.offset);
    if !event.synced {
        println!("{}", pending_notice(&summary));
    }
    Ok(())
}

fn pending_notice(summary: &SyncSummary) -> String {
    if summary.offline {
        "Event saved locally; it will sync when the device is online".to_string()
    } else if summary.skipped_in_flight {
        "Event saved locally; another sync is running and will pick it up".to_string()
    } else {
        format!(
            "Event saved locally, not yet synced ({} of {} submissions failed)",
            summary.failed.len(),
            summary.attempted
        )
    }
}

fn print_event(event: &ClockEvent, offset: FixedOffset) {
    let state = match event.server_id {
        Some(id) if event.synced => format!("#{id}"),
        _ => "pending".to_string(),
    };
    println!(
        "{}  worker {:<4} {:<9} project {:<4} {}",
        event.at.with_timezone(&offset).format("%Y-%m-%d %H:%M"),
        event.worker,
        event.kind,
        event.project.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
        state
    );
}

fn format_minutes(minutes: i64) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

fn parse_optional_datetime(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(s) => {
            let dt = DateTime::parse_from_rfc3339(&s)
                .with_context(|| format!("'{s}' is not an RFC 3339 timestamp"))?
                .with_timezone(&Utc);
            Ok(Some(dt))
        }
        None => Ok(None),
    }
}
