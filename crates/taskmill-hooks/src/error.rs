use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookError {
    /// The hook's handler panicked.
    #[error("Hook execution failed: {0}")]
    ExecutionFailed(String),

    /// A Before hook explicitly blocked the event. Expected flow, not a bug.
    #[error("Hook blocked: {reason}")]
    Blocked { reason: String },
}

pub type Result<T> = std::result::Result<T, HookError>;
