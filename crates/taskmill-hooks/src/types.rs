use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{HookError, Result};

/// Every point in the scheduler lifecycle that can be observed or intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    /// A scheduler tick is about to evaluate its tasks.
    /// Payload fields: started_at, tasks.
    TickStart,
    /// A tick finished.
    /// Payload fields: started_at, evaluated, ran, failed, skipped, recovered.
    TickComplete,
    /// A runner is about to execute a task. Payload fields: identity, name, run_id.
    TaskStart,
    /// A runner reached a terminal state.
    /// Payload fields: identity, run_id, status, duration_secs, message.
    TaskFinish,
    /// A task was skipped because a previous run is still in progress.
    /// Payload fields: identity, elapsed_secs.
    TaskSkipped,
    /// A stale in-progress record was reclassified as exited.
    /// Payload fields: identity, elapsed_secs.
    TaskExited,
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HookEvent::TickStart => "tick_start",
            HookEvent::TickComplete => "tick_complete",
            HookEvent::TaskStart => "task_start",
            HookEvent::TaskFinish => "task_finish",
            HookEvent::TaskSkipped => "task_skipped",
            HookEvent::TaskExited => "task_exited",
        };
        f.write_str(s)
    }
}

/// Controls when a hook fires relative to the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookTiming {
    /// Runs before the action; can modify or block it.
    Before,
    /// Runs after the action; failures are logged, not propagated.
    After,
}

/// The decision a Before hook returns to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum HookAction {
    /// Pass the event through unchanged.
    Allow,
    /// Halt the pipeline. Nothing after this hook runs.
    Block { reason: String },
    /// Replace the event payload before it reaches the next hook or the caller.
    Modify { payload: serde_json::Value },
}

impl HookAction {
    /// Collapse the decision into the caller-facing form:
    /// `Ok(None)` to proceed as-is, `Ok(Some(v))` to proceed with a
    /// replacement value, `Err(Blocked)` to abandon the operation.
    pub fn into_replacement(self) -> Result<Option<serde_json::Value>> {
        match self {
            HookAction::Allow => Ok(None),
            HookAction::Modify { payload } => Ok(Some(payload)),
            HookAction::Block { reason } => Err(HookError::Blocked { reason }),
        }
    }
}

/// The runtime context passed into every hook invocation.
///
/// Payload is untyped JSON so the engine stays decoupled from scheduler types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookContext {
    pub event: HookEvent,
    pub payload: serde_json::Value,
    /// Identity of the task concerned, absent for tick-level events.
    pub task_identity: Option<String>,
    /// Unix timestamp (ms) when the event was created.
    pub timestamp: u64,
}

impl HookContext {
    pub fn new(event: HookEvent, payload: serde_json::Value) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        Self {
            event,
            payload,
            task_identity: None,
            timestamp,
        }
    }

    pub fn for_task(mut self, identity: impl Into<String>) -> Self {
        self.task_identity = Some(identity.into());
        self
    }
}

/// What a hook returned plus how long it took.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookResult {
    pub action: HookAction,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl HookResult {
    pub fn allow(duration_ms: u64) -> Self {
        Self {
            action: HookAction::Allow,
            duration_ms,
        }
    }

    pub fn block(reason: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            action: HookAction::Block {
                reason: reason.into(),
            },
            duration_ms,
        }
    }

    pub fn modify(payload: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            action: HookAction::Modify { payload },
            duration_ms,
        }
    }
}

/// Synchronous hook handler.
///
/// Handlers run on the scheduler thread inside a tick, so they must be cheap.
pub trait HookHandler: Send + Sync {
    fn handle(&self, ctx: &HookContext) -> HookResult;
}

impl<F> HookHandler for F
where
    F: Fn(&HookContext) -> HookResult + Send + Sync,
{
    fn handle(&self, ctx: &HookContext) -> HookResult {
        self(ctx)
    }
}

/// A registered hook binding a name, event filter, timing, and handler.
pub struct HookDefinition {
    /// Unique name used for deregistration and log correlation.
    pub name: String,
    pub event: HookEvent,
    pub timing: HookTiming,
    pub handler: Arc<dyn HookHandler>,
    /// Lower value = earlier execution. Ties broken by registration order.
    pub priority: i32,
}

impl HookDefinition {
    pub fn new(
        name: impl Into<String>,
        event: HookEvent,
        timing: HookTiming,
        handler: Arc<dyn HookHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            event,
            timing,
            handler,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}
