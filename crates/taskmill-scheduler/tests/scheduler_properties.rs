// Tick-level behaviour of the scheduler, checked against both record stores.
// Time is driven by a ManualClock so every threshold is exact.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use rusqlite::Connection;
use taskmill_scheduler::{
    EntityRecordLoader, FnTask, LastRecord, LocalRecordLoader, ManualClock, Message,
    RecordLoader, Runner, Scheduler, SchedulerError, Status, Task, TaskDefinition, TickOutcome,
};

const NOW: i64 = 1_700_000_000;

/// Wraps a loader and counts writes so "nothing was written" can be asserted.
struct Recording<'a> {
    inner: &'a dyn RecordLoader,
    writes: AtomicUsize,
    exits: Mutex<Vec<LastRecord>>,
}

impl<'a> Recording<'a> {
    fn new(inner: &'a dyn RecordLoader) -> Self {
        Self {
            inner,
            writes: AtomicUsize::new(0),
            exits: Mutex::new(Vec::new()),
        }
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn exits(&self) -> Vec<LastRecord> {
        self.exits.lock().unwrap().clone()
    }
}

impl RecordLoader for Recording<'_> {
    fn get_record(&self, task: &dyn Task) -> taskmill_scheduler::Result<Option<LastRecord>> {
        self.inner.get_record(task)
    }

    fn do_start_progress(
        &self,
        runner: &Runner,
        scheduler: &Scheduler,
    ) -> taskmill_scheduler::Result<Option<LastRecord>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.do_start_progress(runner, scheduler)
    }

    fn do_skip_progress(
        &self,
        runner: &Runner,
        scheduler: &Scheduler,
    ) -> taskmill_scheduler::Result<Option<LastRecord>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.do_skip_progress(runner, scheduler)
    }

    fn store_exit_runner(
        &self,
        runner: &Runner,
        scheduler: &Scheduler,
    ) -> taskmill_scheduler::Result<Option<LastRecord>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let record = self.inner.store_exit_runner(runner, scheduler)?;
        if let Some(ref r) = record {
            self.exits.lock().unwrap().push(r.clone());
        }
        Ok(record)
    }

    fn finish(
        &self,
        execution_time: i64,
        runner: &Runner,
        scheduler: &Scheduler,
    ) -> taskmill_scheduler::Result<LastRecord> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.finish(execution_time, runner, scheduler)
    }

    fn clear_cache(&self) {
        self.inner.clear_cache();
    }
}

fn loaders() -> Vec<(&'static str, Box<dyn RecordLoader>)> {
    vec![
        ("local", Box::new(LocalRecordLoader::new())),
        (
            "entity",
            Box::new(EntityRecordLoader::new(Connection::open_in_memory().unwrap())),
        ),
    ]
}

fn counted_task(identity: &str, interval: u64, calls: &Arc<AtomicUsize>) -> Arc<dyn Task> {
    counting(TaskDefinition::every(identity, identity, interval).unwrap(), calls)
}

/// Long interval, short stale threshold: recovery without an immediate rerun.
fn hourly_task(identity: &str, stale_after: u64, calls: &Arc<AtomicUsize>) -> Arc<dyn Task> {
    counting(
        TaskDefinition::every(identity, identity, 3600)
            .unwrap()
            .with_stale_after(stale_after),
        calls,
    )
}

fn counting(definition: TaskDefinition, calls: &Arc<AtomicUsize>) -> Arc<dyn Task> {
    let calls = Arc::clone(calls);
    Arc::new(FnTask::new(definition, move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(Message::success("done"))
    }))
}

fn scheduler_with(clock: &Arc<ManualClock>, tasks: &[Arc<dyn Task>]) -> Scheduler {
    let mut scheduler = Scheduler::new().with_clock(clock.clone());
    for task in tasks {
        scheduler.add_task(Arc::clone(task)).unwrap();
    }
    scheduler
}

/// Leave a PROGRESS record started at `at`, as a run that never finished would.
fn seed_progress(loader: &dyn RecordLoader, task: &Arc<dyn Task>, at: i64) {
    let clock = Arc::new(ManualClock::new(at));
    let scheduler = Scheduler::new().with_clock(clock);
    let runner = Runner::new(Arc::clone(task));
    assert!(loader.do_start_progress(&runner, &scheduler).unwrap().is_some());
}

#[test]
fn first_run_records_success() {
    for (name, loader) in loaders() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = counted_task("nightly_report", 60, &calls);
        let clock = Arc::new(ManualClock::new(NOW));
        let scheduler = scheduler_with(&clock, &[Arc::clone(&task)]);

        let def = task.definition();
        assert!(def.time().should_run(def, NOW, 0, Status::Unknown), "{name}");

        let report = scheduler.run(loader.as_ref()).unwrap();
        assert_eq!(report.outcome("nightly_report"), Some(TickOutcome::Ran(Status::Success)), "{name}");

        loader.clear_cache();
        let record = loader.get_record(task.as_ref()).unwrap().unwrap();
        assert_eq!(record.status(), Status::Success, "{name}");
        assert_eq!(record.last_execution_time(), NOW, "{name}");
        assert_eq!(record.finish_time(), Some(NOW), "{name}");
        assert!(record.execute_duration().unwrap() < 1.0, "{name}");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "{name}");
    }
}

#[test]
fn rerun_inside_interval_writes_nothing() {
    for (name, loader) in loaders() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = counted_task("nightly_report", 60, &calls);
        let clock = Arc::new(ManualClock::new(NOW));
        let scheduler = scheduler_with(&clock, &[Arc::clone(&task)]);
        scheduler.run(loader.as_ref()).unwrap();
        let before = loader.get_record(task.as_ref()).unwrap();

        clock.advance(30);
        let recording = Recording::new(loader.as_ref());
        let report = scheduler.run(&recording).unwrap();

        assert_eq!(report.outcome("nightly_report"), Some(TickOutcome::NotDue), "{name}");
        assert_eq!(recording.writes(), 0, "{name}");
        assert_eq!(loader.get_record(task.as_ref()).unwrap(), before, "{name}");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "{name}");
    }
}

#[test]
fn fresh_progress_is_skipped() {
    for (name, loader) in loaders() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = counted_task("sync_feeds", 60, &calls);
        seed_progress(loader.as_ref(), &task, NOW - 10);

        let clock = Arc::new(ManualClock::new(NOW));
        let scheduler = scheduler_with(&clock, &[Arc::clone(&task)]);
        let def = task.definition();
        assert!(!def.time().should_run(def, NOW, NOW - 10, Status::Progress), "{name}");

        let report = scheduler.run(loader.as_ref()).unwrap();
        assert_eq!(report.outcome("sync_feeds"), Some(TickOutcome::SkippedInProgress), "{name}");
        assert_eq!(calls.load(Ordering::SeqCst), 0, "{name}");

        loader.clear_cache();
        let record = loader.get_record(task.as_ref()).unwrap().unwrap();
        assert_eq!(record.status(), Status::Skipped, "{name}");
        assert_eq!(record.last_execution_time(), NOW - 10, "{name}");
    }
}

#[test]
fn skipped_run_stays_held_until_it_goes_stale() {
    for (name, loader) in loaders() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = counted_task("sync_feeds", 60, &calls);
        seed_progress(loader.as_ref(), &task, NOW);

        let clock = Arc::new(ManualClock::new(NOW));
        let scheduler = scheduler_with(&clock, &[Arc::clone(&task)]);
        let recording = Recording::new(loader.as_ref());
        let mut outcomes = Vec::new();
        for at in [30, 90, 330] {
            clock.set(NOW + at);
            loader.clear_cache();
            let report = scheduler.run(&recording).unwrap();
            outcomes.push((at, report.outcome("sync_feeds"), report.recovered()));
        }

        assert_eq!(
            outcomes,
            [
                (30, Some(TickOutcome::SkippedInProgress), 0),
                (90, Some(TickOutcome::SkippedInProgress), 0),
                (330, Some(TickOutcome::Ran(Status::Success)), 1),
            ],
            "{name}"
        );
        let exits = recording.exits();
        assert_eq!(exits.len(), 1, "{name}");
        assert_eq!(exits[0].last_execution_time(), NOW, "{name}");
        assert_eq!(exits[0].execute_duration(), Some(330.0), "{name}");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "{name}");
    }
}

#[test]
fn stale_progress_is_exited_then_run() {
    for (name, loader) in loaders() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = counted_task("sync_feeds", 60, &calls);
        seed_progress(loader.as_ref(), &task, NOW - 400);

        let clock = Arc::new(ManualClock::new(NOW));
        let scheduler = scheduler_with(&clock, &[Arc::clone(&task)]);
        let recording = Recording::new(loader.as_ref());
        let report = scheduler.run(&recording).unwrap();

        let exits = recording.exits();
        assert_eq!(exits.len(), 1, "{name}");
        assert_eq!(exits[0].status(), Status::Exited, "{name}");
        assert_eq!(exits[0].execute_duration(), Some(400.0), "{name}");
        assert_eq!(exits[0].finish_time(), Some(NOW), "{name}");

        assert_eq!(report.recovered(), 1, "{name}");
        assert_eq!(report.outcome("sync_feeds"), Some(TickOutcome::Ran(Status::Success)), "{name}");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "{name}");
    }
}

#[test]
fn nothing_is_written_inside_the_interval() {
    // (configured interval, seconds since last run); 1s is floored to 5s.
    let cases = [(1, 4), (5, 4), (60, 59), (3600, 1)];
    for (name, loader) in loaders() {
        for (i, (interval, elapsed)) in cases.into_iter().enumerate() {
            let identity = format!("job_{i}");
            let calls = Arc::new(AtomicUsize::new(0));
            let task = counted_task(&identity, interval, &calls);
            let clock = Arc::new(ManualClock::new(NOW));
            let scheduler = scheduler_with(&clock, &[Arc::clone(&task)]);
            scheduler.run(loader.as_ref()).unwrap();

            clock.advance(elapsed);
            let def = task.definition();
            assert!(!def.time().should_run(def, NOW + elapsed, NOW, Status::Success), "{name} {identity}");

            let recording = Recording::new(loader.as_ref());
            let report = scheduler.run(&recording).unwrap();
            assert_eq!(report.outcome(&identity), Some(TickOutcome::NotDue), "{name} {identity}");
            assert_eq!(recording.writes(), 0, "{name} {identity}");
        }
    }
}

#[test]
fn fresh_progress_never_starts_the_task() {
    for (name, loader) in loaders() {
        let calls = Arc::new(AtomicUsize::new(0));
        // Due many times over by interval (5s), none stale yet (300s).
        let tasks: Vec<Arc<dyn Task>> = [("age_10", 10), ("age_150", 150), ("age_299", 299)]
            .into_iter()
            .map(|(identity, age)| {
                let task = counted_task(identity, 5, &calls);
                seed_progress(loader.as_ref(), &task, NOW - age);
                task
            })
            .collect();

        let clock = Arc::new(ManualClock::new(NOW));
        let scheduler = scheduler_with(&clock, &tasks);
        let recording = Recording::new(loader.as_ref());
        let report = scheduler.run(&recording).unwrap();

        for task in &tasks {
            assert_eq!(
                report.outcome(task.identity().as_str()),
                Some(TickOutcome::SkippedInProgress),
                "{name} {}",
                task.identity()
            );
        }
        assert_eq!(recording.writes(), 3, "{name}");
        assert_eq!(calls.load(Ordering::SeqCst), 0, "{name}");
    }
}

#[test]
fn stale_progress_exits_exactly_once() {
    for (name, loader) in loaders() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = hourly_task("archive", 300, &calls);
        seed_progress(loader.as_ref(), &task, NOW - 400);

        let clock = Arc::new(ManualClock::new(NOW));
        let scheduler = scheduler_with(&clock, &[Arc::clone(&task)]);
        let recording = Recording::new(loader.as_ref());

        let first = scheduler.run(&recording).unwrap();
        assert_eq!(first.recovered(), 1, "{name}");
        // Re-evaluated as EXITED: 400s is still inside the hourly interval.
        assert_eq!(first.outcome("archive"), Some(TickOutcome::NotDue), "{name}");

        clock.advance(10);
        let second = scheduler.run(&recording).unwrap();
        assert_eq!(second.recovered(), 0, "{name}");
        assert_eq!(recording.exits().len(), 1, "{name}");

        let record = loader.get_record(task.as_ref()).unwrap().unwrap();
        assert_eq!(record.status(), Status::Exited, "{name}");
        assert_eq!(record.last_execution_time(), NOW - 400, "{name}");
        assert_eq!(calls.load(Ordering::SeqCst), 0, "{name}");
    }
}

#[test]
fn terminal_records_never_finish_before_they_start() {
    for (name, loader) in loaders() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ok = counted_task("ok_job", 60, &calls);
        let failing: Arc<dyn Task> = Arc::new(FnTask::new(
            TaskDefinition::every("failing_job", "Failing", 60).unwrap(),
            |_| bail!("disk full"),
        ));
        let abandoned = hourly_task("abandoned_job", 300, &calls);
        seed_progress(loader.as_ref(), &abandoned, NOW - 1_000);

        let clock = Arc::new(ManualClock::new(NOW));
        let tasks = [ok, failing, abandoned];
        let scheduler = scheduler_with(&clock, &tasks);
        for _ in 0..3 {
            scheduler.run(loader.as_ref()).unwrap();
            clock.advance(61);
        }

        loader.clear_cache();
        for task in &tasks {
            let record = loader.get_record(task.as_ref()).unwrap().unwrap();
            assert!(record.status().is_terminal(), "{name} {}", task.identity());
            let finish = record.finish_time().unwrap();
            assert!(finish >= record.last_execution_time(), "{name} {}", task.identity());
            assert!(record.execute_duration().unwrap() >= 0.0, "{name} {}", task.identity());
        }
    }
}

#[test]
fn failing_task_does_not_stop_the_others() {
    for (name, loader) in loaders() {
        let calls = Arc::new(AtomicUsize::new(0));
        let first = counted_task("first", 60, &calls);
        let second: Arc<dyn Task> = Arc::new(FnTask::new(
            TaskDefinition::every("second", "Second", 60).unwrap(),
            |_| bail!("connection refused"),
        ));
        let third = counted_task("third", 60, &calls);

        let clock = Arc::new(ManualClock::new(NOW));
        let tasks = [first, second, third];
        let scheduler = scheduler_with(&clock, &tasks);
        let report = scheduler.run(loader.as_ref()).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2, "{name}");
        assert_eq!(report.failed(), 1, "{name}");
        loader.clear_cache();
        let statuses: Vec<Status> = tasks
            .iter()
            .map(|t| loader.get_record(t.as_ref()).unwrap().unwrap().status())
            .collect();
        assert_eq!(statuses, [Status::Success, Status::Failure, Status::Success], "{name}");
        let failed = loader.get_record(tasks[1].as_ref()).unwrap().unwrap();
        assert_eq!(failed.message().payload(), Some("connection refused"), "{name}");
    }
}

#[test]
fn panicking_task_is_isolated_like_a_failing_one() {
    for (name, loader) in loaders() {
        let calls = Arc::new(AtomicUsize::new(0));
        let panicking: Arc<dyn Task> = Arc::new(FnTask::new(
            TaskDefinition::every("panicky", "Panicky", 60).unwrap(),
            |_| panic!("unexpected state"),
        ));
        let after = counted_task("after", 60, &calls);
        let clock = Arc::new(ManualClock::new(NOW));
        let scheduler = scheduler_with(&clock, &[Arc::clone(&panicking), after]);

        let report = scheduler.run(loader.as_ref()).unwrap();
        assert_eq!(report.outcome("panicky"), Some(TickOutcome::Ran(Status::Failure)), "{name}");
        assert_eq!(report.outcome("after"), Some(TickOutcome::Ran(Status::Success)), "{name}");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "{name}");
        assert!(!scheduler.is_active("panicky"), "{name}");
    }
}

#[test]
fn record_store_failure_aborts_the_tick_and_names_the_task() {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("CREATE TABLE task_scheduler (identity TEXT PRIMARY KEY);")
        .unwrap();
    let loader = EntityRecordLoader::new(conn);

    let calls = Arc::new(AtomicUsize::new(0));
    let clock = Arc::new(ManualClock::new(NOW));
    let scheduler = scheduler_with(
        &clock,
        &[counted_task("first", 60, &calls), counted_task("second", 60, &calls)],
    );

    match scheduler.run(&loader) {
        Err(err @ SchedulerError::Persistence { .. }) => {
            assert_eq!(err.task_identity(), Some("first"));
            assert!(err.to_string().contains("first"));
        }
        other => panic!("expected a persistence error, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn concurrent_claim_on_a_shared_database_is_declined() {
    let path = std::env::temp_dir().join(format!("taskmill-{}.db", uuid::Uuid::now_v7()));
    let ours = EntityRecordLoader::open(&path).unwrap();
    let theirs = EntityRecordLoader::open(&path).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let task = counted_task("sync_feeds", 60, &calls);
    let clock = Arc::new(ManualClock::new(NOW));
    let scheduler = scheduler_with(&clock, &[Arc::clone(&task)]);

    // Both processes see the finished run and cache it.
    scheduler.run(&ours).unwrap();
    assert!(theirs.get_record(task.as_ref()).unwrap().is_some());

    // The other process claims the next run first; our cached view is stale.
    clock.advance(120);
    seed_progress(&theirs, &task, NOW + 120);
    let report = scheduler.run(&ours).unwrap();

    assert_eq!(report.outcome("sync_feeds"), Some(TickOutcome::Declined));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    ours.clear_cache();
    let record = ours.get_record(task.as_ref()).unwrap().unwrap();
    assert_eq!(record.status(), Status::Progress);

    drop((ours, theirs));
    let _ = std::fs::remove_file(&path);
}
