//! Persistence boundary for [`LastRecord`]s.

mod entity;
mod local;

pub use entity::{EntityRecordLoader, StoredRecord};
pub use local::LocalRecordLoader;

use crate::error::Result;
use crate::message::Message;
use crate::record::LastRecord;
use crate::runner::Runner;
use crate::scheduler::Scheduler;
use crate::task::Task;
use crate::types::Status;

/// Where run records live.
///
/// Everything except [`finish`](RecordLoader::finish) may return `Ok(None)`
/// to decline a write that lost a race; `finish` always produces a record.
/// Write failures are returned, never swallowed.
pub trait RecordLoader: Send + Sync {
    /// Cached record if present, otherwise the backing store's.
    fn get_record(&self, task: &dyn Task) -> Result<Option<LastRecord>>;

    /// Store PROGRESS with `execution_time = now`. Declines when the stored
    /// record still holds a run (see [`LastRecord::holds_progress`]) and the
    /// task is not forced.
    fn do_start_progress(&self, runner: &Runner, scheduler: &Scheduler)
        -> Result<Option<LastRecord>>;

    /// Store SKIPPED. The execution time is left as it was, and so is the
    /// missing finish time of a run still in flight.
    fn do_skip_progress(&self, runner: &Runner, scheduler: &Scheduler)
        -> Result<Option<LastRecord>>;

    /// Store EXITED for a PROGRESS record nobody is running any more.
    fn store_exit_runner(&self, runner: &Runner, scheduler: &Scheduler)
        -> Result<Option<LastRecord>>;

    /// Store the runner's terminal state with finish time and duration.
    fn finish(
        &self,
        execution_time: i64,
        runner: &Runner,
        scheduler: &Scheduler,
    ) -> Result<LastRecord>;

    /// Forget cached records so the next read goes to the store.
    fn clear_cache(&self) {}
}

pub(crate) fn progress_record(runner: &Runner, now: i64) -> LastRecord {
    LastRecord::new(
        runner.identity().clone(),
        now,
        Status::Progress,
        Message::progress(format!("run {} started", runner.run_id())),
    )
}

pub(crate) fn skipped_record(previous: Option<&LastRecord>, runner: &Runner) -> LastRecord {
    let message = runner
        .message()
        .cloned()
        .unwrap_or_else(|| Message::skipped("previous run still in progress"));
    match previous {
        Some(prev) => prev
            .clone()
            .with_status(Status::Skipped)
            .with_message(message),
        None => LastRecord::new(runner.identity().clone(), 0, Status::Skipped, message)
            .with_finish(0, 0.0),
    }
}

pub(crate) fn exited_record(previous: Option<&LastRecord>, runner: &Runner, now: i64) -> LastRecord {
    let base = match previous {
        Some(prev) => prev.clone(),
        None => LastRecord::new(runner.identity().clone(), 0, Status::Unknown, Message::unknown()),
    };
    let duration = runner
        .duration()
        .unwrap_or_else(|| base.elapsed(now) as f64);
    let message = runner
        .message()
        .cloned()
        .unwrap_or_else(|| Message::exited("process exited before the run finished"));
    base.with_status(Status::Exited)
        .with_message(message)
        .with_finish(now, duration)
}

pub(crate) fn finished_record(execution_time: i64, runner: &Runner, now: i64) -> LastRecord {
    let status = if runner.status().is_terminal() {
        runner.status()
    } else {
        Status::Unknown
    };
    let message = runner.message().cloned().unwrap_or_else(Message::unknown);
    LastRecord::new(runner.identity().clone(), execution_time, status, message)
        .with_finish(now, runner.duration().unwrap_or(0.0))
}
