use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{PoisonError, RwLock};
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::error::HookError;
use crate::types::{HookAction, HookContext, HookDefinition, HookResult, HookTiming};

/// Registry and dispatcher for scheduler lifecycle hooks.
///
/// Share one instance per process (`Arc<HookEngine>`); registration takes
/// `&self` so hooks can be added after the scheduler is built.
pub struct HookEngine {
    /// Sorted by priority ascending after every registration.
    hooks: RwLock<Vec<HookDefinition>>,
}

impl HookEngine {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Register a hook. Re-sorts the list so priority order is always correct.
    pub fn register(&self, hook: HookDefinition) {
        let mut hooks = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
        debug!(name = %hook.name, event = %hook.event, "hook registered");
        hooks.push(hook);
        // Stable sort preserves registration order within the same priority.
        hooks.sort_by_key(|h| h.priority);
    }

    /// Remove a hook by name. Silent no-op if the name is not found.
    pub fn unregister(&self, name: &str) {
        let mut hooks = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
        let before = hooks.len();
        hooks.retain(|h| h.name != name);
        if hooks.len() < before {
            debug!(name, "hook unregistered");
        }
    }

    pub fn len(&self) -> usize {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Emit an event: run Before hooks, then After hooks.
    ///
    /// If a Before hook blocks, After hooks are skipped: the event never happened.
    pub fn emit(&self, mut ctx: HookContext) -> HookResult {
        let t = Instant::now();
        let action = self.emit_before(&mut ctx);

        if !matches!(action, HookAction::Block { .. }) {
            self.emit_after(&ctx);
        }

        HookResult {
            action,
            duration_ms: t.elapsed().as_millis() as u64,
        }
    }

    /// Run all Before hooks in priority order.
    ///
    /// Stops at the first Block. Modify updates the context payload in place
    /// so subsequent hooks see the mutated version; the final payload is
    /// returned as `Modify` if any hook changed it.
    pub fn emit_before(&self, ctx: &mut HookContext) -> HookAction {
        let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner);
        let event = ctx.event;
        let mut modified = false;

        for hook in hooks
            .iter()
            .filter(|h| h.event == event && h.timing == HookTiming::Before)
        {
            let t = Instant::now();
            let result = match catch_unwind(AssertUnwindSafe(|| hook.handler.handle(&*ctx))) {
                Ok(result) => result,
                Err(_) => {
                    let err = HookError::ExecutionFailed(format!("{} panicked", hook.name));
                    error!(hook = %hook.name, "{err}; treating as allow");
                    continue;
                }
            };

            debug!(
                hook = %hook.name,
                duration_ms = t.elapsed().as_millis() as u64,
                "before hook completed"
            );

            match result.action {
                HookAction::Block { ref reason } => {
                    warn!(hook = %hook.name, %reason, event = %ctx.event, "hook blocked event");
                    return result.action;
                }
                HookAction::Modify { payload } => {
                    ctx.payload = payload;
                    modified = true;
                }
                HookAction::Allow => {}
            }
        }

        if modified {
            HookAction::Modify {
                payload: ctx.payload.clone(),
            }
        } else {
            HookAction::Allow
        }
    }

    /// Run all After hooks. Errors are logged, never propagated.
    pub fn emit_after(&self, ctx: &HookContext) {
        let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner);

        for hook in hooks
            .iter()
            .filter(|h| h.event == ctx.event && h.timing == HookTiming::After)
        {
            let t = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| hook.handler.handle(ctx)));
            let elapsed_ms = t.elapsed().as_millis() as u64;

            match outcome {
                Ok(HookResult {
                    action: HookAction::Block { reason },
                    ..
                }) => {
                    // After hooks cannot block; log the misconfiguration.
                    error!(
                        hook = %hook.name,
                        duration_ms = elapsed_ms,
                        %reason,
                        "after hook returned Block; ignored (use Before timing to block)"
                    );
                }
                Ok(_) => {
                    debug!(hook = %hook.name, duration_ms = elapsed_ms, "after hook completed")
                }
                Err(_) => {
                    let err = HookError::ExecutionFailed(format!("{} panicked", hook.name));
                    error!(hook = %hook.name, duration_ms = elapsed_ms, "{err}");
                }
            }
        }
    }
}

impl Default for HookEngine {
    fn default() -> Self {
        Self::new()
    }
}
