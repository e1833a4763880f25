use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use taskmill_core::config::{IntervalSpec, MINIMUM_INTERVAL_TIME, PREVIOUS_MIN_TIME};

use crate::error::{Result, SchedulerError};
use crate::task::TaskDefinition;
use crate::types::Status;

/// Policy deciding when a task is eligible to run.
///
/// Implementors provide [`is_due`](SchedulerTime::is_due) and
/// [`next_run_at`](SchedulerTime::next_run_at); the in-progress gate in
/// [`should_run`](SchedulerTime::should_run) is shared by all policies.
pub trait SchedulerTime: Send + Sync + fmt::Debug {
    /// Whether enough time has passed since `last_execution_time`.
    fn is_due(&self, now: i64, last_execution_time: i64) -> bool;

    /// Unix seconds of the next eligible run, never earlier than `now`.
    fn next_run_at(&self, now: i64, last_execution_time: i64) -> Option<i64>;

    /// Age after which a PROGRESS record is treated as abandoned.
    fn stale_after(&self) -> i64 {
        PREVIOUS_MIN_TIME
    }

    /// Human-readable form for logs and the CLI.
    fn describe(&self) -> String;

    /// Callers pass PROGRESS for any record that still holds a run, including
    /// a SKIPPED one written over an unfinished run.
    fn should_run(
        &self,
        task: &TaskDefinition,
        now: i64,
        last_execution_time: i64,
        last_status: Status,
    ) -> bool {
        if last_status == Status::Progress && !task.force_run_in_progress() {
            let elapsed = now.saturating_sub(last_execution_time);
            if elapsed < task.stale_threshold() {
                return false;
            }
        }
        self.is_due(now, last_execution_time)
    }

    /// [`next_run_at`](SchedulerTime::next_run_at) as a date in `tz` (UTC when `None`).
    fn next_run_date(
        &self,
        now: i64,
        last_execution_time: i64,
        tz: Option<FixedOffset>,
    ) -> Option<DateTime<FixedOffset>> {
        let at = self.next_run_at(now, last_execution_time)?;
        let utc = DateTime::<Utc>::from_timestamp(at, 0)?;
        Some(utc.with_timezone(&tz.unwrap_or_else(|| Utc.fix())))
    }
}

/// Fixed interval in seconds, floored at [`MINIMUM_INTERVAL_TIME`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalTime {
    secs: u64,
}

impl IntervalTime {
    pub fn new(secs: u64) -> Self {
        Self { secs }
    }

    /// The interval actually enforced.
    pub fn effective_secs(&self) -> i64 {
        i64::try_from(self.secs)
            .unwrap_or(i64::MAX)
            .max(MINIMUM_INTERVAL_TIME)
    }
}

impl SchedulerTime for IntervalTime {
    fn is_due(&self, now: i64, last_execution_time: i64) -> bool {
        now.saturating_sub(last_execution_time) >= self.effective_secs()
    }

    fn next_run_at(&self, now: i64, last_execution_time: i64) -> Option<i64> {
        if last_execution_time <= 0 {
            return Some(now);
        }
        Some(
            last_execution_time
                .saturating_add(self.effective_secs())
                .max(now),
        )
    }

    fn stale_after(&self) -> i64 {
        PREVIOUS_MIN_TIME.max(self.effective_secs().saturating_mul(2))
    }

    fn describe(&self) -> String {
        format!("every {}s", self.effective_secs())
    }
}

/// Cron expression policy.
///
/// Accepts the classic five-field form (`min hour dom month dow`), the
/// six/seven-field seconds-first form, and `@hourly`-style shorthands.
#[derive(Clone)]
pub struct CronTime {
    expression: String,
    schedule: cron::Schedule,
}

impl CronTime {
    /// Parse eagerly so a bad expression fails when the task is defined.
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let normalized = match trimmed.split_whitespace().count() {
            _ if trimmed.starts_with('@') => trimmed.to_string(),
            5 => format!("0 {trimmed}"),
            6 | 7 => trimmed.to_string(),
            n => {
                return Err(SchedulerError::InvalidInterval(format!(
                    "{expression:?}: expected 5 to 7 fields, found {n}"
                )))
            }
        };
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| SchedulerError::InvalidInterval(format!("{expression:?}: {e}")))?;
        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First occurrence strictly after `ts`.
    fn next_after(&self, ts: i64) -> Option<i64> {
        let from = DateTime::<Utc>::from_timestamp(ts, 0)?;
        self.schedule.after(&from).next().map(|dt| dt.timestamp())
    }
}

impl fmt::Debug for CronTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronTime")
            .field("expression", &self.expression)
            .finish()
    }
}

impl SchedulerTime for CronTime {
    fn is_due(&self, now: i64, last_execution_time: i64) -> bool {
        self.next_after(last_execution_time)
            .is_some_and(|next| now >= next)
    }

    fn next_run_at(&self, now: i64, last_execution_time: i64) -> Option<i64> {
        self.next_after(last_execution_time).map(|next| next.max(now))
    }

    fn describe(&self) -> String {
        format!("cron {}", self.expression)
    }
}

/// Turn a config interval into a policy. Numeric strings are seconds.
pub fn from_spec(spec: &IntervalSpec) -> Result<Arc<dyn SchedulerTime>> {
    match spec {
        IntervalSpec::Seconds(secs) => Ok(Arc::new(IntervalTime::new(*secs))),
        IntervalSpec::Expression(expr) => match expr.trim().parse::<u64>() {
            Ok(secs) => Ok(Arc::new(IntervalTime::new(secs))),
            Err(_) => Ok(Arc::new(CronTime::parse(expr)?)),
        },
    }
}
