//! `taskmill-hooks`: lifecycle hooks for the task scheduler.
//!
//! Before hooks run in priority order and can allow, block or rewrite the
//! event payload. After hooks are observers: their result is logged and
//! otherwise ignored.

pub mod engine;
pub mod error;
pub mod types;

pub use engine::HookEngine;
pub use error::{HookError, Result};
pub use types::{
    HookAction, HookContext, HookDefinition, HookEvent, HookHandler, HookResult, HookTiming,
};
