use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::{json, Value};
use taskmill_hooks::{HookAction, HookContext, HookEngine, HookError, HookEvent};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SchedulerError};
use crate::loader::RecordLoader;
use crate::message::Message;
use crate::runner::Runner;
use crate::task::{Task, TaskIdentity};
use crate::types::Status;

/// What happened to one task during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Policy said no; nothing was written.
    NotDue,
    /// A previous run is still unaccounted for; SKIPPED was recorded.
    SkippedInProgress,
    /// The task body ran (or a hook stopped it) and ended in this status.
    Ran(Status),
    /// The loader refused the PROGRESS claim; another process got there first.
    Declined,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub identity: TaskIdentity,
    /// A stale held run was converted to EXITED before evaluation.
    pub recovered: bool,
    pub outcome: TickOutcome,
}

/// Result of one [`Scheduler::run`] pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub started_at: i64,
    /// Set when a `TickStart` hook refused the tick; `tasks` is empty then.
    pub blocked: Option<String>,
    pub tasks: Vec<TaskReport>,
}

impl TickReport {
    fn new(started_at: i64) -> Self {
        Self {
            started_at,
            blocked: None,
            tasks: Vec::new(),
        }
    }

    pub fn outcome(&self, identity: &str) -> Option<TickOutcome> {
        self.tasks
            .iter()
            .find(|t| t.identity.as_str() == identity)
            .map(|t| t.outcome)
    }

    pub fn ran(&self) -> usize {
        self.count(|t| matches!(t.outcome, TickOutcome::Ran(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|t| t.outcome == TickOutcome::Ran(Status::Failure))
    }

    pub fn skipped(&self) -> usize {
        self.count(|t| {
            matches!(
                t.outcome,
                TickOutcome::SkippedInProgress | TickOutcome::Declined
            )
        })
    }

    pub fn recovered(&self) -> usize {
        self.count(|t| t.recovered)
    }

    fn count(&self, pred: impl Fn(&TaskReport) -> bool) -> usize {
        self.tasks.iter().filter(|t| pred(t)).count()
    }

    fn summary(&self) -> Value {
        json!({
            "started_at": self.started_at,
            "evaluated": self.tasks.len(),
            "ran": self.ran(),
            "failed": self.failed(),
            "skipped": self.skipped(),
            "recovered": self.recovered(),
        })
    }
}

/// Marks a task as running in this process until dropped.
pub struct ActiveGuard<'a> {
    scheduler: &'a Scheduler,
    identity: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.active().remove(&self.identity);
    }
}

/// Registry of tasks plus the tick that drives them.
///
/// Construct one per process and pass it by reference; there is no global
/// instance.
pub struct Scheduler {
    tasks: Vec<Arc<dyn Task>>,
    clock: Arc<dyn Clock>,
    hooks: Option<Arc<HookEngine>>,
    /// Identities whose body is executing in this process right now.
    active: Mutex<HashSet<String>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            clock: Arc::new(SystemClock),
            hooks: None,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<HookEngine>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Register a task. Identities must be unique.
    pub fn add_task(&mut self, task: Arc<dyn Task>) -> Result<()> {
        if self.has_task(task.identity().as_str()) {
            return Err(SchedulerError::DuplicateTask {
                identity: task.identity().to_string(),
            });
        }
        debug!(identity = %task.identity(), policy = %task.definition().time().describe(), "task registered");
        self.tasks.push(task);
        Ok(())
    }

    pub fn add(&mut self, task: impl Task + 'static) -> Result<()> {
        self.add_task(Arc::new(task))
    }

    pub fn has_task(&self, identity: &str) -> bool {
        self.task(identity).is_some()
    }

    /// Registered tasks in registration order.
    pub fn tasks(&self) -> &[Arc<dyn Task>] {
        &self.tasks
    }

    pub fn task(&self, identity: &str) -> Option<&Arc<dyn Task>> {
        self.tasks.iter().find(|t| t.identity().as_str() == identity)
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Whether a runner for `identity` is executing in this process.
    pub fn is_active(&self, identity: &str) -> bool {
        self.active().contains(identity)
    }

    pub fn mark_active(&self, identity: &TaskIdentity) -> ActiveGuard<'_> {
        self.active().insert(identity.to_string());
        ActiveGuard {
            scheduler: self,
            identity: identity.to_string(),
        }
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit_before(
        &self,
        event: HookEvent,
        payload: Value,
        identity: Option<&TaskIdentity>,
    ) -> HookAction {
        match &self.hooks {
            Some(hooks) => hooks.emit_before(&mut context(event, payload, identity)),
            None => HookAction::Allow,
        }
    }

    pub(crate) fn emit_after(&self, event: HookEvent, payload: Value, identity: Option<&TaskIdentity>) {
        if let Some(hooks) = &self.hooks {
            hooks.emit_after(&context(event, payload, identity));
        }
    }

    /// One tick: evaluate every task in registration order.
    ///
    /// Task failures are recorded, not returned. A record-store error aborts
    /// the tick and is returned with the task it concerned.
    pub fn run(&self, loader: &dyn RecordLoader) -> Result<TickReport> {
        let mut report = TickReport::new(self.now());

        let gate = self
            .emit_before(
                HookEvent::TickStart,
                json!({ "started_at": report.started_at, "tasks": self.tasks.len() }),
                None,
            )
            .into_replacement();
        if let Err(HookError::Blocked { reason }) = gate {
            info!(%reason, "tick blocked by hook");
            report.blocked = Some(reason);
            return Ok(report);
        }

        for task in &self.tasks {
            let task_report = self.evaluate(task, loader)?;
            report.tasks.push(task_report);
        }

        info!(
            evaluated = report.tasks.len(),
            ran = report.ran(),
            failed = report.failed(),
            skipped = report.skipped(),
            recovered = report.recovered(),
            "tick complete"
        );
        self.emit_after(HookEvent::TickComplete, report.summary(), None);
        Ok(report)
    }

    fn evaluate(&self, task: &Arc<dyn Task>, loader: &dyn RecordLoader) -> Result<TaskReport> {
        let definition = task.definition();
        let identity = definition.identity().clone();
        let now = self.now();
        let mut record = loader.get_record(task.as_ref())?;
        let mut recovered = false;

        let in_progress = record
            .as_ref()
            .filter(|r| r.holds_progress())
            .map(|r| (r.elapsed(now), r.is_stale(now, definition.stale_threshold())));

        if let Some((elapsed, stale)) = in_progress {
            let live = self.is_active(identity.as_str());
            if stale && !live {
                warn!(%identity, elapsed, "stale progress record; marking exited");
                let exit = Runner::exited(
                    Arc::clone(task),
                    None,
                    Message::exited(format!("no live runner after {elapsed}s in progress")),
                );
                record = loader.store_exit_runner(&exit, self)?;
                recovered = true;
                self.emit_after(
                    HookEvent::TaskExited,
                    json!({ "identity": identity.as_str(), "elapsed_secs": elapsed }),
                    Some(&identity),
                );
            } else if live || !definition.force_run_in_progress() {
                debug!(%identity, elapsed, live, "previous run in progress; skipping");
                let skip = Runner::skipped(
                    Arc::clone(task),
                    Message::skipped("previous run still in progress"),
                );
                loader.do_skip_progress(&skip, self)?;
                self.emit_after(
                    HookEvent::TaskSkipped,
                    json!({ "identity": identity.as_str(), "elapsed_secs": elapsed }),
                    Some(&identity),
                );
                return Ok(TaskReport {
                    identity,
                    recovered,
                    outcome: TickOutcome::SkippedInProgress,
                });
            }
        }

        // A forced task may get here while a skip still holds the run; the
        // policy gate has to see that as PROGRESS too.
        let (last_time, last_status) = record.as_ref().map_or((0, Status::Unknown), |r| {
            let status = if r.holds_progress() {
                Status::Progress
            } else {
                r.status()
            };
            (r.last_execution_time(), status)
        });
        if !definition
            .time()
            .should_run(definition, now, last_time, last_status)
        {
            debug!(%identity, last_time, %last_status, "not due");
            return Ok(TaskReport {
                identity,
                recovered,
                outcome: TickOutcome::NotDue,
            });
        }

        let mut runner = Runner::new(Arc::clone(task));
        let outcome = match runner.run(loader, self)? {
            Some(_) => TickOutcome::Ran(runner.status()),
            None => TickOutcome::Declined,
        };
        Ok(TaskReport {
            identity,
            recovered,
            outcome,
        })
    }
}

fn context(event: HookEvent, payload: Value, identity: Option<&TaskIdentity>) -> HookContext {
    let ctx = HookContext::new(event, payload);
    match identity {
        Some(identity) => ctx.for_task(identity.as_str()),
        None => ctx,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use taskmill_hooks::{HookDefinition, HookResult, HookTiming};

    use super::*;
    use crate::clock::ManualClock;
    use crate::loader::LocalRecordLoader;
    use crate::record::LastRecord;
    use crate::task::{FnTask, TaskDefinition};

    fn counting(identity: &str, calls: &Arc<AtomicUsize>) -> Arc<dyn Task> {
        let calls = Arc::clone(calls);
        Arc::new(FnTask::new(
            TaskDefinition::every(identity, identity, 60).unwrap(),
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Message::success("ok"))
            },
        ))
    }

    fn progress_since(identity: &str, at: i64) -> LastRecord {
        LastRecord::new(
            TaskIdentity::parse(identity).unwrap(),
            at,
            Status::Progress,
            Message::progress("running"),
        )
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        scheduler.add_task(counting("report", &calls)).unwrap();
        let err = scheduler.add_task(counting("report", &calls)).unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateTask { identity } if identity == "report"));
        assert!(scheduler.has_task("report"));
        assert_eq!(scheduler.tasks().len(), 1);
    }

    #[test]
    fn tasks_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = Scheduler::new().with_clock(Arc::new(ManualClock::new(10_000)));
        for identity in ["zeta", "alpha", "mid"] {
            let order = Arc::clone(&order);
            scheduler
                .add(FnTask::new(
                    TaskDefinition::every(identity, identity, 60).unwrap(),
                    move |runner: &Runner| {
                        order.lock().unwrap().push(runner.identity().to_string());
                        Ok(Message::success("ok"))
                    },
                ))
                .unwrap();
        }

        let report = scheduler.run(&LocalRecordLoader::new()).unwrap();
        assert_eq!(report.ran(), 3);
        assert_eq!(*order.lock().unwrap(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn blocked_tick_touches_nothing() {
        let hooks = Arc::new(HookEngine::new());
        hooks.register(HookDefinition::new(
            "maintenance",
            HookEvent::TickStart,
            HookTiming::Before,
            Arc::new(|_: &HookContext| HookResult::block("maintenance window", 0)),
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new().with_hooks(hooks);
        scheduler.add_task(counting("report", &calls)).unwrap();
        let loader = LocalRecordLoader::new();

        let report = scheduler.run(&loader).unwrap();
        assert_eq!(report.blocked.as_deref(), Some("maintenance window"));
        assert!(report.tasks.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(loader.records().unwrap().is_empty());
    }

    #[test]
    fn tick_complete_hook_sees_the_summary() {
        let hooks = Arc::new(HookEngine::new());
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        hooks.register(HookDefinition::new(
            "audit",
            HookEvent::TickComplete,
            HookTiming::After,
            Arc::new(move |ctx: &HookContext| {
                *sink.lock().unwrap() = Some(ctx.payload.clone());
                HookResult::allow(0)
            }),
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new()
            .with_clock(Arc::new(ManualClock::new(10_000)))
            .with_hooks(hooks);
        scheduler.add_task(counting("report", &calls)).unwrap();

        scheduler.run(&LocalRecordLoader::new()).unwrap();
        let payload = seen.lock().unwrap().clone().unwrap();
        assert_eq!(payload["ran"], 1);
        assert_eq!(payload["evaluated"], 1);
    }

    #[test]
    fn forced_task_runs_over_fresh_progress() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut scheduler = Scheduler::new().with_clock(Arc::new(ManualClock::new(10_000)));
        scheduler
            .add(FnTask::new(
                TaskDefinition::every("rebuild", "Rebuild", 60)
                    .unwrap()
                    .with_force_run_in_progress(true),
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Message::success("rebuilt"))
                },
            ))
            .unwrap();
        // Started 120s ago: past the interval but well short of stale.
        let loader = LocalRecordLoader::with_records([progress_since("rebuild", 9_880)]);

        let report = scheduler.run(&loader).unwrap();
        assert_eq!(report.outcome("rebuild"), Some(TickOutcome::Ran(Status::Success)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn live_runner_is_never_marked_exited() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new().with_clock(Arc::new(ManualClock::new(10_000)));
        scheduler.add_task(counting("report", &calls)).unwrap();
        let loader = LocalRecordLoader::with_records([progress_since("report", 1_000)]);

        let identity = TaskIdentity::parse("report").unwrap();
        let report = {
            let _live = scheduler.mark_active(&identity);
            scheduler.run(&loader).unwrap()
        };
        assert_eq!(report.outcome("report"), Some(TickOutcome::SkippedInProgress));
        assert_eq!(report.recovered(), 0);
        assert!(!scheduler.is_active("report"));
    }

    #[test]
    fn report_serializes_with_tagged_outcomes() {
        let report = TickReport {
            started_at: 5,
            blocked: None,
            tasks: vec![TaskReport {
                identity: TaskIdentity::parse("report").unwrap(),
                recovered: false,
                outcome: TickOutcome::Ran(Status::Failure),
            }],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["tasks"][0]["identity"], "report");
        assert_eq!(json["tasks"][0]["outcome"]["outcome"], "ran");
        assert_eq!(json["tasks"][0]["outcome"]["status"], "failure");
    }
}
