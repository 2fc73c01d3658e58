use std::sync::{Arc, Barrier};

use chrono::{Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};

use sitelog::clock::{Clock, DEFAULT_OFFSET_SECS, ManualClock};
use sitelog::db::{self, SharedConnection, UpsertOutcome};
use sitelog::snapshot::Scheduler;
use sitelog::tracker::ProjectTracker;
use sitelog::types::ProjectStatus;

fn ist() -> FixedOffset {
    FixedOffset::east_opt(DEFAULT_OFFSET_SECS).unwrap()
}

/// 09:30 IST on 3 October 2024.
fn morning() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 10, 3, 4, 0, 0).unwrap(), ist()))
}

fn scheduler(conn: SharedConnection, clock: Arc<ManualClock>) -> Scheduler {
    Scheduler::new(conn, clock, "Automated Daily Snapshot", NaiveTime::from_hms_opt(18, 0, 0).unwrap())
}

#[test]
fn concurrent_writers_on_separate_connections_leave_one_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("site.db").to_string_lossy().to_string();
    let clock = morning();
    let project = {
        let conn = db::shared(db::init(&path).unwrap());
        ProjectTracker::new(conn, clock.clone()).create_project("Ring road").unwrap()
    };

    let writers = 4;
    let barrier = Barrier::new(writers);
    let outcomes: Vec<UpsertOutcome> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..writers)
            .map(|i| {
                let barrier = &barrier;
                let path = path.clone();
                let clock = clock.clone();
                s.spawn(move || {
                    let scheduler = scheduler(db::shared(db::init(&path).unwrap()), clock);
                    barrier.wait();
                    scheduler.upsert_today(project, 10 + i as u8, "race").unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let created = outcomes.iter().filter(|o| **o == UpsertOutcome::Created).count();
    assert_eq!(created, 1);
    assert_eq!(outcomes.len() - created, writers - 1);

    let conn = db::init(&path).unwrap();
    assert_eq!(db::query_snapshots_for_project(project, &conn).unwrap().len(), 1);
}

#[tokio::test]
async fn sweep_after_restart_does_not_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("site.db").to_string_lossy().to_string();
    let clock = morning();

    {
        let conn = db::shared(db::init(&path).unwrap());
        let tracker = ProjectTracker::new(conn.clone(), clock.clone());
        tracker.create_project("Substation").unwrap();
        tracker.create_project("Culvert").unwrap();
        let summary = scheduler(conn, clock.clone()).run_daily_sweep().await.unwrap();
        assert_eq!(summary.written, 2);
    }

    let scheduler = scheduler(db::shared(db::init(&path).unwrap()), clock);
    let summary = scheduler.run_daily_sweep().await.unwrap();
    assert_eq!(summary.written, 0);
    assert_eq!(summary.skipped_already_present, 2);
    assert_eq!(scheduler.history(1).unwrap().len(), 1);
}

#[tokio::test]
async fn daily_history_tracks_progress_per_day() {
    let clock = morning();
    let conn = db::shared(db::init(":memory:").unwrap());
    let tracker = ProjectTracker::new(conn.clone(), clock.clone());
    let scheduler = scheduler(conn, clock.clone());

    let project = tracker.create_project("Water tank").unwrap();
    let task = tracker.add_task(project, "Foundation").unwrap();
    let excavate = tracker.add_milestone(project, task, "Excavate").unwrap();
    let pour = tracker.add_milestone(project, task, "Pour").unwrap();
    let finish = tracker.add_milestone(project, task, "Cure").unwrap();

    tracker.set_milestone_completed(project, task, excavate, true).unwrap();
    scheduler.run_daily_sweep().await.unwrap();

    // Later the same day: progress moves but the day's entry stays put.
    tracker.set_milestone_completed(project, task, pour, true).unwrap();
    let again = scheduler.run_daily_sweep().await.unwrap();
    assert_eq!(again.skipped_already_present, 1);
    assert_eq!(scheduler.history(project).unwrap()[0].progress, 33);

    // 23:59 IST is still the same day.
    clock.set(Utc.with_ymd_and_hms(2024, 10, 3, 18, 29, 0).unwrap());
    assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 10, 3).unwrap());
    assert_eq!(
        scheduler.correct_today(project, 67, "Site engineer correction").unwrap(),
        UpsertOutcome::Updated
    );

    // Two minutes later it is the next day in IST, though not in UTC.
    clock.advance(Duration::minutes(2));
    tracker.set_milestone_completed(project, task, finish, true).unwrap();
    scheduler.run_daily_sweep().await.unwrap();

    let history = scheduler.history(project).unwrap();
    let days: Vec<(NaiveDate, u8)> = history.iter().map(|e| (e.day, e.progress)).collect();
    assert_eq!(
        days,
        [
            (NaiveDate::from_ymd_opt(2024, 10, 3).unwrap(), 67),
            (NaiveDate::from_ymd_opt(2024, 10, 4).unwrap(), 100),
        ]
    );
    assert_eq!(history[0].note, "Site engineer correction");
    assert_eq!(tracker.project(project).unwrap().status, ProjectStatus::Completed);
}

#[tokio::test]
async fn held_project_is_still_snapshotted_without_status_change() {
    let clock = morning();
    let conn = db::shared(db::init(":memory:").unwrap());
    let tracker = ProjectTracker::new(conn.clone(), clock.clone());
    let project = tracker.create_project("Pedestrian bridge").unwrap();
    let task = tracker.add_task(project, "Girders").unwrap();
    let only = tracker.add_milestone(project, task, "Lift girders").unwrap();
    tracker.set_hold(project, true).unwrap();
    tracker.set_milestone_completed(project, task, only, true).unwrap();

    scheduler(conn, clock).run_daily_sweep().await.unwrap();
    let stored = tracker.project(project).unwrap();
    assert_eq!(stored.progress, 100);
    assert_eq!(stored.status, ProjectStatus::Hold);
}
