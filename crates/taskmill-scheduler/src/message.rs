use serde::{Deserialize, Serialize};

use crate::types::Status;

/// The outcome category a [`Message`] reports. Each kind has a fixed status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Success,
    Failure,
    Skipped,
    Exited,
    Stopped,
    Progress,
    Unknown,
}

impl MessageKind {
    pub fn status(self) -> Status {
        match self {
            MessageKind::Success => Status::Success,
            MessageKind::Failure => Status::Failure,
            MessageKind::Skipped => Status::Skipped,
            MessageKind::Exited => Status::Exited,
            MessageKind::Stopped => Status::Stopped,
            MessageKind::Progress => Status::Progress,
            MessageKind::Unknown => Status::Unknown,
        }
    }

    /// Kind reporting `status`. Queue has no message of its own and maps to Unknown.
    pub fn from_status(status: Status) -> Self {
        match status {
            Status::Success => MessageKind::Success,
            Status::Failure => MessageKind::Failure,
            Status::Skipped => MessageKind::Skipped,
            Status::Exited => MessageKind::Exited,
            Status::Stopped => MessageKind::Stopped,
            Status::Progress => MessageKind::Progress,
            Status::Unknown | Status::Queue => MessageKind::Unknown,
        }
    }
}

/// Immutable result value returned by a task and stored with its record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
}

impl Message {
    pub fn new(kind: MessageKind, payload: Option<String>) -> Self {
        Self { kind, payload }
    }

    /// A message of `kind` with no payload.
    pub fn empty(kind: MessageKind) -> Self {
        Self::new(kind, None)
    }

    pub fn success(payload: impl Into<String>) -> Self {
        Self::new(MessageKind::Success, Some(payload.into()))
    }

    pub fn failure(payload: impl Into<String>) -> Self {
        Self::new(MessageKind::Failure, Some(payload.into()))
    }

    pub fn skipped(payload: impl Into<String>) -> Self {
        Self::new(MessageKind::Skipped, Some(payload.into()))
    }

    pub fn exited(payload: impl Into<String>) -> Self {
        Self::new(MessageKind::Exited, Some(payload.into()))
    }

    pub fn stopped(payload: impl Into<String>) -> Self {
        Self::new(MessageKind::Stopped, Some(payload.into()))
    }

    pub fn progress(payload: impl Into<String>) -> Self {
        Self::new(MessageKind::Progress, Some(payload.into()))
    }

    pub fn unknown() -> Self {
        Self::empty(MessageKind::Unknown)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn status(&self) -> Status {
        self.kind.status()
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.payload {
            Some(payload) => write!(f, "{}: {payload}", self.status()),
            None => write!(f, "{}", self.status()),
        }
    }
}
