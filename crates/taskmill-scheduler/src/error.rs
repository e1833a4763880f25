use thiserror::Error;

use crate::types::Status;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Writing or reading a task's record failed. Always names the task so a
    /// failed tick can be attributed.
    #[error("record store error for task {identity}: {source}")]
    Persistence {
        identity: String,
        #[source]
        source: rusqlite::Error,
    },

    /// SQLite error outside any single task (opening the store, listing rows).
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Task identity is empty or not `[a-z0-9_]+`.
    #[error("Invalid task identity: {0:?}")]
    InvalidIdentity(String),

    /// The interval definition could not be parsed.
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    /// A task with the same identity is already registered.
    #[error("Task already registered: {identity}")]
    DuplicateTask { identity: String },

    /// A runner was asked to run from a state other than Queue.
    #[error("Runner for task {identity} cannot run from status {from}")]
    InvalidTransition { identity: String, from: Status },

    #[error("Serialization error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl SchedulerError {
    pub fn persistence(identity: impl Into<String>, source: rusqlite::Error) -> Self {
        SchedulerError::Persistence {
            identity: identity.into(),
            source,
        }
    }

    /// The task this error is attributed to, if any.
    pub fn task_identity(&self) -> Option<&str> {
        match self {
            SchedulerError::Persistence { identity, .. }
            | SchedulerError::DuplicateTask { identity }
            | SchedulerError::InvalidTransition { identity, .. } => Some(identity),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
