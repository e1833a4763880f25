use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::task::TaskIdentity;
use crate::types::Status;

/// Snapshot of a task's most recent known execution state.
///
/// Records are values: every transition produces a new record through the
/// `with_*` methods rather than mutating one in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastRecord {
    /// Back-reference to the owning task; resolve through the scheduler registry.
    identity: TaskIdentity,
    /// Unix seconds of the last run start, 0 when the task never ran.
    last_execution_time: i64,
    status: Status,
    message: Message,
    finish_time: Option<i64>,
    /// Seconds.
    execute_duration: Option<f64>,
}

impl LastRecord {
    pub fn new(
        identity: TaskIdentity,
        last_execution_time: i64,
        status: Status,
        message: Message,
    ) -> Self {
        Self {
            identity,
            last_execution_time,
            status,
            message,
            finish_time: None,
            execute_duration: None,
        }
    }

    pub fn identity(&self) -> &TaskIdentity {
        &self.identity
    }

    pub fn last_execution_time(&self) -> i64 {
        self.last_execution_time
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn finish_time(&self) -> Option<i64> {
        self.finish_time
    }

    pub fn execute_duration(&self) -> Option<f64> {
        self.execute_duration
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.message = message;
        self
    }

    pub fn with_last_execution_time(mut self, last_execution_time: i64) -> Self {
        self.last_execution_time = last_execution_time;
        self
    }

    /// Attach the terminal timing. Negative durations are clamped to zero.
    pub fn with_finish(mut self, finish_time: i64, execute_duration: f64) -> Self {
        self.finish_time = Some(finish_time.max(self.last_execution_time));
        self.execute_duration = Some(execute_duration.max(0.0));
        self
    }

    /// Drop terminal timing, as when a new run starts.
    pub fn without_finish(mut self) -> Self {
        self.finish_time = None;
        self.execute_duration = None;
        self
    }

    /// Seconds between the last run start and `now`, never negative.
    pub fn elapsed(&self, now: i64) -> i64 {
        now.saturating_sub(self.last_execution_time).max(0)
    }

    /// Whether a run started for this record is still unaccounted for.
    ///
    /// True for PROGRESS, and for a SKIPPED record written over a run that
    /// never finished: the skip keeps the start time but no finish time.
    pub fn holds_progress(&self) -> bool {
        match self.status {
            Status::Progress => true,
            Status::Skipped => self.finish_time.is_none() && self.last_execution_time > 0,
            _ => false,
        }
    }

    /// A held run at least `threshold` seconds old.
    pub fn is_stale(&self, now: i64, threshold: i64) -> bool {
        self.holds_progress() && self.elapsed(now) >= threshold
    }
}
