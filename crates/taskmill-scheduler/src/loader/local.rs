use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, instrument};

use super::{exited_record, finished_record, progress_record, skipped_record, RecordLoader};
use crate::error::{Result, SchedulerError};
use crate::record::LastRecord;
use crate::runner::Runner;
use crate::scheduler::Scheduler;
use crate::task::Task;

/// Records kept in a process-local map keyed by task identity.
///
/// Nothing survives a restart; suited to single-process use and tests.
#[derive(Default)]
pub struct LocalRecordLoader {
    records: Mutex<HashMap<String, LastRecord>>,
}

impl LocalRecordLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from existing records, e.g. ones carried over from elsewhere.
    pub fn with_records(records: impl IntoIterator<Item = LastRecord>) -> Self {
        let map = records
            .into_iter()
            .map(|r| (r.identity().to_string(), r))
            .collect();
        Self {
            records: Mutex::new(map),
        }
    }

    /// All records, sorted by identity.
    pub fn records(&self) -> Result<Vec<LastRecord>> {
        let records = self.lock()?;
        let mut all: Vec<LastRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.identity().cmp(b.identity()));
        Ok(all)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, LastRecord>>> {
        self.records
            .lock()
            .map_err(|_| SchedulerError::LockPoisoned("local record map"))
    }

    fn store(&self, record: LastRecord) -> Result<LastRecord> {
        self.lock()?
            .insert(record.identity().to_string(), record.clone());
        Ok(record)
    }
}

impl RecordLoader for LocalRecordLoader {
    fn get_record(&self, task: &dyn Task) -> Result<Option<LastRecord>> {
        Ok(self.lock()?.get(task.identity().as_str()).cloned())
    }

    #[instrument(skip_all, fields(identity = %runner.identity()))]
    fn do_start_progress(
        &self,
        runner: &Runner,
        scheduler: &Scheduler,
    ) -> Result<Option<LastRecord>> {
        let mut records = self.lock()?;
        let key = runner.identity().as_str();
        let held = records
            .get(key)
            .is_some_and(LastRecord::holds_progress);
        if held && !runner.task().definition().force_run_in_progress() {
            debug!("record already in progress; declining");
            return Ok(None);
        }
        let record = progress_record(runner, scheduler.now());
        records.insert(key.to_string(), record.clone());
        Ok(Some(record))
    }

    #[instrument(skip_all, fields(identity = %runner.identity()))]
    fn do_skip_progress(
        &self,
        runner: &Runner,
        _scheduler: &Scheduler,
    ) -> Result<Option<LastRecord>> {
        let previous = self.get_record(runner.task().as_ref())?;
        self.store(skipped_record(previous.as_ref(), runner)).map(Some)
    }

    #[instrument(skip_all, fields(identity = %runner.identity()))]
    fn store_exit_runner(
        &self,
        runner: &Runner,
        scheduler: &Scheduler,
    ) -> Result<Option<LastRecord>> {
        let previous = self.get_record(runner.task().as_ref())?;
        self.store(exited_record(previous.as_ref(), runner, scheduler.now()))
            .map(Some)
    }

    #[instrument(skip_all, fields(identity = %runner.identity()))]
    fn finish(
        &self,
        execution_time: i64,
        runner: &Runner,
        scheduler: &Scheduler,
    ) -> Result<LastRecord> {
        self.store(finished_record(execution_time, runner, scheduler.now()))
    }
}
