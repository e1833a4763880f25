use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use taskmill_core::config::IntervalSpec;

use crate::error::{Result, SchedulerError};
use crate::message::Message;
use crate::runner::Runner;
use crate::time::{self, CronTime, IntervalTime, SchedulerTime};

/// Primary key of a task's persisted record: non-empty `[a-z0-9_]+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskIdentity(String);

impl TaskIdentity {
    pub fn parse(s: &str) -> Result<Self> {
        let valid = !s.is_empty()
            && s
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
        if !valid {
            return Err(SchedulerError::InvalidIdentity(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TaskIdentity {
    type Error = SchedulerError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<TaskIdentity> for String {
    fn from(identity: TaskIdentity) -> Self {
        identity.0
    }
}

impl fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Static attributes of a task, fixed at registration.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    identity: TaskIdentity,
    name: String,
    time: Arc<dyn SchedulerTime>,
    force_run_in_progress: bool,
    stale_after: Option<i64>,
}

impl TaskDefinition {
    pub fn new(identity: &str, name: impl Into<String>, time: Arc<dyn SchedulerTime>) -> Result<Self> {
        Ok(Self {
            identity: TaskIdentity::parse(identity)?,
            name: name.into(),
            time,
            force_run_in_progress: false,
            stale_after: None,
        })
    }

    /// Fixed interval in seconds.
    pub fn every(identity: &str, name: impl Into<String>, secs: u64) -> Result<Self> {
        Self::new(identity, name, Arc::new(IntervalTime::new(secs)))
    }

    /// Cron expression, validated here.
    pub fn cron(identity: &str, name: impl Into<String>, expression: &str) -> Result<Self> {
        Self::new(identity, name, Arc::new(CronTime::parse(expression)?))
    }

    pub fn from_spec(identity: &str, name: impl Into<String>, spec: &IntervalSpec) -> Result<Self> {
        Self::new(identity, name, time::from_spec(spec)?)
    }

    pub fn with_force_run_in_progress(mut self, force: bool) -> Self {
        self.force_run_in_progress = force;
        self
    }

    /// Override the stale-progress threshold for this task.
    pub fn with_stale_after(mut self, secs: u64) -> Self {
        self.stale_after = Some(i64::try_from(secs).unwrap_or(i64::MAX));
        self
    }

    pub fn identity(&self) -> &TaskIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn time(&self) -> &dyn SchedulerTime {
        self.time.as_ref()
    }

    pub fn force_run_in_progress(&self) -> bool {
        self.force_run_in_progress
    }

    /// Seconds after which a PROGRESS record of this task counts as abandoned.
    pub fn stale_threshold(&self) -> i64 {
        self.stale_after.unwrap_or_else(|| self.time.stale_after())
    }
}

/// A schedulable unit of work.
pub trait Task: Send + Sync {
    fn definition(&self) -> &TaskDefinition;

    /// Do the work. An `Err` (or a panic) is recorded as a FAILURE.
    fn start(&self, runner: &Runner) -> anyhow::Result<Message>;

    /// Stored in `executed_object_class`.
    fn type_name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn identity(&self) -> &TaskIdentity {
        self.definition().identity()
    }

    fn name(&self) -> &str {
        self.definition().name()
    }
}

/// A task whose body is a closure.
pub struct FnTask<F> {
    definition: TaskDefinition,
    body: F,
}

impl<F> FnTask<F>
where
    F: Fn(&Runner) -> anyhow::Result<Message> + Send + Sync,
{
    pub fn new(definition: TaskDefinition, body: F) -> Self {
        Self { definition, body }
    }
}

impl<F> Task for FnTask<F>
where
    F: Fn(&Runner) -> anyhow::Result<Message> + Send + Sync,
{
    fn definition(&self) -> &TaskDefinition {
        &self.definition
    }

    fn start(&self, runner: &Runner) -> anyhow::Result<Message> {
        (self.body)(runner)
    }

    fn type_name(&self) -> &str {
        "FnTask"
    }
}
