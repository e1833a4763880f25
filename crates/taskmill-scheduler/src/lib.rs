//! `taskmill-scheduler`: recurring task execution with durable run records.
//!
//! # Overview
//!
//! A [`Scheduler`] owns a set of [`Task`]s. Each call to [`Scheduler::run`]
//! is one tick: every task is evaluated in registration order, its last
//! [`LastRecord`] is fetched through a [`RecordLoader`], and the task's
//! [`SchedulerTime`] policy decides whether it is due. Due tasks run to
//! completion on the calling thread through a [`Runner`], which records the
//! PROGRESS transition before the task starts and the terminal state after.
//!
//! A PROGRESS record left behind by a process that died mid-run is picked up
//! on a later tick once it is older than the task's stale threshold, stored
//! as EXITED, and the task is re-evaluated in the same tick.
//!
//! # Record stores
//!
//! | Loader                 | Backing store                          |
//! |------------------------|----------------------------------------|
//! | [`LocalRecordLoader`]  | process-local map, lost on exit        |
//! | [`EntityRecordLoader`] | SQLite `task_scheduler` table          |
//!
//! # Status codes
//!
//! | Status   | Code | Terminal |
//! |----------|------|----------|
//! | Unknown  | 0    | yes      |
//! | Queue    | 1    | no       |
//! | Progress | 2    | no       |
//! | Success  | 3    | yes      |
//! | Failure  | 4    | yes      |
//! | Skipped  | 5    | yes      |
//! | Exited   | 6    | yes      |
//! | Stopped  | 7    | yes      |

pub mod clock;
pub mod codec;
pub mod daemon;
pub mod db;
pub mod error;
pub mod loader;
pub mod message;
pub mod record;
pub mod runner;
pub mod scheduler;
pub mod task;
pub mod time;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use daemon::SchedulerDaemon;
pub use error::{Result, SchedulerError};
pub use loader::{EntityRecordLoader, LocalRecordLoader, RecordLoader, StoredRecord};
pub use message::{Message, MessageKind};
pub use record::LastRecord;
pub use runner::Runner;
pub use scheduler::{Scheduler, TaskReport, TickOutcome, TickReport};
pub use task::{FnTask, Task, TaskDefinition, TaskIdentity};
pub use time::{CronTime, IntervalTime, SchedulerTime};
pub use types::Status;
