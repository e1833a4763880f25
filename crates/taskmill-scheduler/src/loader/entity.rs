use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, instrument};

use super::{exited_record, finished_record, progress_record, skipped_record, RecordLoader};
use crate::codec;
use crate::db;
use crate::error::{Result, SchedulerError};
use crate::message::Message;
use crate::record::LastRecord;
use crate::runner::Runner;
use crate::scheduler::Scheduler;
use crate::task::{Task, TaskIdentity};
use crate::types::Status;

const SELECT_COLUMNS: &str = "SELECT identity, name, executed_object_class, status_code,
        execution_time, finish_time, execute_duration, message
 FROM task_scheduler";

/// One row of the `task_scheduler` table, message already decoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub identity: String,
    pub name: String,
    pub executed_object_class: Option<String>,
    pub status: Status,
    pub execution_time: i64,
    pub finish_time: Option<i64>,
    pub execute_duration: Option<f64>,
    pub message: Message,
}

impl StoredRecord {
    /// `None` when the stored identity is not a valid task identity.
    pub fn to_last_record(&self) -> Option<LastRecord> {
        let identity = TaskIdentity::parse(&self.identity).ok()?;
        let record = LastRecord::new(
            identity,
            self.execution_time,
            self.status,
            self.message.clone(),
        );
        Some(match (self.finish_time, self.execute_duration) {
            (Some(finish), duration) => record.with_finish(finish, duration.unwrap_or(0.0)),
            (None, _) => record,
        })
    }
}

/// Records persisted to the SQLite `task_scheduler` table, one row per task.
///
/// The table is created (or migrated) on first access. Reads are cached per
/// identity until [`RecordLoader::clear_cache`] is called.
pub struct EntityRecordLoader {
    conn: Mutex<Connection>,
    cache: Mutex<HashMap<String, LastRecord>>,
    schema_ready: AtomicBool,
}

impl EntityRecordLoader {
    /// Wrap an open connection. No schema work happens until the first access.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            cache: Mutex::new(HashMap::new()),
            schema_ready: AtomicBool::new(false),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(Self::new(conn))
    }

    /// Every stored row ordered by identity.
    pub fn list_records(&self) -> Result<Vec<StoredRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY identity"))?;
        let rows = stmt.query_map([], row_to_stored)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Lock the connection, creating the schema first if that has not
    /// succeeded yet.
    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| SchedulerError::LockPoisoned("entity connection"))?;
        if !self.schema_ready.load(Ordering::Acquire) && db::ensure_schema(&conn) {
            self.schema_ready.store(true, Ordering::Release);
        }
        Ok(conn)
    }

    fn cache(&self) -> Result<MutexGuard<'_, HashMap<String, LastRecord>>> {
        self.cache
            .lock()
            .map_err(|_| SchedulerError::LockPoisoned("entity record cache"))
    }

    fn remember(&self, record: &LastRecord) -> Result<()> {
        self.cache()?
            .insert(record.identity().to_string(), record.clone());
        Ok(())
    }

    fn load(&self, identity: &TaskIdentity) -> Result<Option<LastRecord>> {
        if let Some(hit) = self.cache()?.get(identity.as_str()) {
            return Ok(Some(hit.clone()));
        }

        let stored = {
            let conn = self.connection()?;
            conn.query_row(
                &format!("{SELECT_COLUMNS} WHERE identity = ?1"),
                [identity.as_str()],
                row_to_stored,
            )
            .optional()
            .map_err(|e| SchedulerError::persistence(identity.as_str(), e))?
        };

        let record = stored.and_then(|row| row.to_last_record());
        if let Some(ref record) = record {
            self.remember(record)?;
        }
        Ok(record)
    }

    /// Insert or overwrite every column of the row.
    fn upsert(&self, runner: &Runner, record: &LastRecord) -> Result<()> {
        let identity = record.identity().as_str();
        let blob = codec::encode(record.message())?;
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO task_scheduler
             (identity, name, executed_object_class, status_code, execution_time,
              finish_time, execute_duration, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(identity) DO UPDATE SET
                name = excluded.name,
                executed_object_class = excluded.executed_object_class,
                status_code = excluded.status_code,
                execution_time = excluded.execution_time,
                finish_time = excluded.finish_time,
                execute_duration = excluded.execute_duration,
                message = excluded.message",
            rusqlite::params![
                identity,
                runner.task().name(),
                runner.task().type_name(),
                record.status().code(),
                record.last_execution_time(),
                record.finish_time(),
                record.execute_duration(),
                blob,
            ],
        )
        .map_err(|e| SchedulerError::persistence(identity, e))?;
        Ok(())
    }
}

impl RecordLoader for EntityRecordLoader {
    fn get_record(&self, task: &dyn Task) -> Result<Option<LastRecord>> {
        self.load(task.identity())
    }

    /// One conditional upsert: the row moves to PROGRESS only if no run is
    /// held there (or the task is forced), so two processes cannot both
    /// claim the same run. A SKIPPED row without a finish time still holds
    /// the run it was written over.
    #[instrument(skip_all, fields(identity = %runner.identity()))]
    fn do_start_progress(
        &self,
        runner: &Runner,
        scheduler: &Scheduler,
    ) -> Result<Option<LastRecord>> {
        let record = progress_record(runner, scheduler.now());
        let identity = record.identity().as_str();
        let blob = codec::encode(record.message())?;
        let force = runner.task().definition().force_run_in_progress();

        let changed = {
            let conn = self.connection()?;
            conn.execute(
                "INSERT INTO task_scheduler
                 (identity, name, executed_object_class, status_code, execution_time,
                  finish_time, execute_duration, message)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, ?6)
                 ON CONFLICT(identity) DO UPDATE SET
                    name = excluded.name,
                    executed_object_class = excluded.executed_object_class,
                    status_code = excluded.status_code,
                    execution_time = excluded.execution_time,
                    finish_time = NULL,
                    execute_duration = NULL,
                    message = excluded.message
                 WHERE ?7 OR NOT (
                    task_scheduler.status_code = ?4
                    OR (task_scheduler.status_code = ?8
                        AND task_scheduler.finish_time IS NULL
                        AND task_scheduler.execution_time > 0))",
                rusqlite::params![
                    identity,
                    runner.task().name(),
                    runner.task().type_name(),
                    Status::Progress.code(),
                    record.last_execution_time(),
                    blob,
                    force,
                    Status::Skipped.code(),
                ],
            )
            .map_err(|e| SchedulerError::persistence(identity, e))?
        };

        if changed == 0 {
            debug!("row still holds a run; declining");
            self.cache()?.remove(identity);
            return Ok(None);
        }
        self.remember(&record)?;
        Ok(Some(record))
    }

    #[instrument(skip_all, fields(identity = %runner.identity()))]
    fn do_skip_progress(
        &self,
        runner: &Runner,
        _scheduler: &Scheduler,
    ) -> Result<Option<LastRecord>> {
        let previous = self.load(runner.identity())?;
        // `previous` is reconciled, so a legacy row gets its real start time
        // written back to the column here.
        let record = skipped_record(previous.as_ref(), runner);
        self.upsert(runner, &record)?;
        self.remember(&record)?;
        Ok(Some(record))
    }

    #[instrument(skip_all, fields(identity = %runner.identity()))]
    fn store_exit_runner(
        &self,
        runner: &Runner,
        scheduler: &Scheduler,
    ) -> Result<Option<LastRecord>> {
        let previous = self.load(runner.identity())?;
        let record = exited_record(previous.as_ref(), runner, scheduler.now());
        self.upsert(runner, &record)?;
        self.remember(&record)?;
        Ok(Some(record))
    }

    #[instrument(skip_all, fields(identity = %runner.identity()))]
    fn finish(
        &self,
        execution_time: i64,
        runner: &Runner,
        scheduler: &Scheduler,
    ) -> Result<LastRecord> {
        let record = finished_record(execution_time, runner, scheduler.now());
        self.upsert(runner, &record)?;
        self.remember(&record)?;
        Ok(record)
    }

    fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache() {
            cache.clear();
        }
    }
}

/// Map a row to a `StoredRecord`, unwrapping legacy message payloads.
fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRecord> {
    let column_status = Status::from_code(row.get::<_, Option<i64>>(3)?.unwrap_or(0));
    let column_time = row.get::<_, Option<i64>>(4)?.unwrap_or(0);
    let blob = row.get::<_, Option<String>>(7)?.unwrap_or_default();
    let (status, execution_time, message) =
        codec::reconcile(column_status, column_time, codec::decode(&blob));

    Ok(StoredRecord {
        identity: row.get(0)?,
        name: row.get(1)?,
        executed_object_class: row.get(2)?,
        status,
        execution_time,
        finish_time: row.get(5)?,
        execute_duration: row.get(6)?,
        message,
    })
}
