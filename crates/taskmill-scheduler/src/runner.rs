use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use taskmill_hooks::{HookError, HookEvent};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::loader::RecordLoader;
use crate::message::{Message, MessageKind};
use crate::record::LastRecord;
use crate::scheduler::Scheduler;
use crate::task::{Task, TaskIdentity};
use crate::types::Status;

/// Executes one task once and tracks what happened.
///
/// `Queue → Progress → {Success, Failure, Skipped, Exited, Stopped, Unknown}`.
pub struct Runner {
    run_id: Uuid,
    task: Arc<dyn Task>,
    status: Status,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    duration: Option<f64>,
    message: Option<Message>,
}

impl Runner {
    pub fn new(task: Arc<dyn Task>) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            task,
            status: Status::Queue,
            started_at: None,
            finished_at: None,
            duration: None,
            message: None,
        }
    }

    /// A runner standing for a run that was skipped without executing.
    pub fn skipped(task: Arc<dyn Task>, message: Message) -> Self {
        let mut runner = Self::new(task);
        runner.status = Status::Skipped;
        runner.message = Some(message);
        runner
    }

    /// A runner standing for a run whose process died. `duration` is `None`
    /// when nothing better than "time since it started" is known.
    pub fn exited(task: Arc<dyn Task>, duration: Option<f64>, message: Message) -> Self {
        let mut runner = Self::new(task);
        runner.status = Status::Exited;
        runner.duration = duration;
        runner.message = Some(message);
        runner
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    pub fn identity(&self) -> &TaskIdentity {
        self.task.identity()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn started_at(&self) -> Option<i64> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<i64> {
        self.finished_at
    }

    /// Measured wall time of the task body, seconds.
    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    /// Run the task to completion and persist the outcome.
    ///
    /// Returns `Ok(None)` when the loader declined the PROGRESS claim
    /// (another runner holds it); the task body is not invoked then.
    /// Task errors and panics become FAILURE records; only loader errors
    /// are returned as `Err`.
    pub fn run(
        &mut self,
        loader: &dyn RecordLoader,
        scheduler: &Scheduler,
    ) -> Result<Option<LastRecord>> {
        if self.status != Status::Queue {
            return Err(SchedulerError::InvalidTransition {
                identity: self.identity().to_string(),
                from: self.status,
            });
        }

        let start_payload = json!({
            "identity": self.identity().as_str(),
            "name": self.task.name(),
            "run_id": self.run_id.to_string(),
        });
        let replacement = match scheduler
            .emit_before(HookEvent::TaskStart, start_payload, Some(self.identity()))
            .into_replacement()
        {
            Ok(None) => None,
            Ok(Some(payload)) => replacement_message(payload),
            Err(HookError::Blocked { reason }) => {
                return self.stop(loader, scheduler, reason).map(Some);
            }
            Err(e) => {
                warn!(identity = %self.identity(), error = %e, "task start hook failed; running anyway");
                None
            }
        };

        let started_at = scheduler.now();
        self.status = Status::Progress;
        self.started_at = Some(started_at);

        if loader.do_start_progress(self, scheduler)?.is_none() {
            info!(identity = %self.identity(), run_id = %self.run_id, "progress claim declined");
            self.status = Status::Skipped;
            self.message = Some(Message::skipped("another runner holds this task"));
            return Ok(None);
        }

        info!(identity = %self.identity(), run_id = %self.run_id, "task started");
        let clock = Instant::now();
        let outcome = match replacement {
            Some(message) => {
                info!(identity = %self.identity(), run_id = %self.run_id, "task body replaced by hook");
                Ok(Ok(message))
            }
            None => {
                let _live = scheduler.mark_active(self.identity());
                catch_unwind(AssertUnwindSafe(|| self.task.start(self)))
            }
        };
        let duration = clock.elapsed().as_secs_f64();

        let message = match outcome {
            Ok(Ok(message)) => settle(message),
            Ok(Err(e)) => {
                warn!(identity = %self.identity(), run_id = %self.run_id, error = %e, "task failed");
                Message::failure(format!("{e:#}"))
            }
            Err(panic) => {
                let reason = panic_reason(panic.as_ref());
                warn!(identity = %self.identity(), run_id = %self.run_id, %reason, "task panicked");
                Message::failure(format!("task panicked: {reason}"))
            }
        };

        self.status = message.status();
        self.duration = Some(duration);
        self.finished_at = Some(scheduler.now());
        self.message = Some(message);

        let record = loader.finish(started_at, self, scheduler)?;
        info!(
            identity = %self.identity(),
            run_id = %self.run_id,
            status = %self.status,
            duration_secs = duration,
            "task finished"
        );
        self.emit_finish(scheduler);
        Ok(Some(record))
    }

    /// A Before hook refused the start: record STOPPED without running.
    fn stop(
        &mut self,
        loader: &dyn RecordLoader,
        scheduler: &Scheduler,
        reason: String,
    ) -> Result<LastRecord> {
        info!(identity = %self.identity(), run_id = %self.run_id, %reason, "task start blocked by hook");
        let now = scheduler.now();
        self.status = Status::Stopped;
        self.started_at = Some(now);
        self.finished_at = Some(now);
        self.duration = Some(0.0);
        self.message = Some(Message::stopped(format!("blocked: {reason}")));

        let record = loader.finish(now, self, scheduler)?;
        self.emit_finish(scheduler);
        Ok(record)
    }

    fn emit_finish(&self, scheduler: &Scheduler) {
        let payload = json!({
            "identity": self.identity().as_str(),
            "run_id": self.run_id.to_string(),
            "status": self.status.to_string(),
            "duration_secs": self.duration,
            "message": self.message.as_ref().and_then(|m| m.payload()),
        });
        scheduler.emit_after(HookEvent::TaskFinish, payload, Some(self.identity()));
    }
}

/// A Before hook may stand in for the task body by replacing the start
/// payload with a serialized [`Message`]. Any other replacement is ignored.
fn replacement_message(payload: serde_json::Value) -> Option<Message> {
    match serde_json::from_value::<Message>(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            debug!(error = %e, "start hook payload is not a message; ignoring");
            None
        }
    }
}

/// Progress is not a terminal state; a task returning it is recorded as Unknown.
fn settle(message: Message) -> Message {
    if message.kind() == MessageKind::Progress {
        debug!("task returned a progress message; recording as unknown");
        return Message::new(MessageKind::Unknown, message.payload().map(str::to_string));
    }
    message
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
