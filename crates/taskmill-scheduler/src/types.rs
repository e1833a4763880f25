use serde::{Deserialize, Serialize};

/// Lifecycle state of a task run, persisted as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// No information, or a stored code this build does not recognise.
    Unknown,
    /// Runner constructed, not yet started.
    Queue,
    /// Currently executing (or was, until the process died).
    Progress,
    Success,
    Failure,
    /// Not run because a previous run was still in progress.
    Skipped,
    /// A PROGRESS record whose process never reported back.
    Exited,
    /// Stopped before the task body ran (e.g. blocked by a hook).
    Stopped,
}

impl Status {
    pub const ALL: [Status; 8] = [
        Status::Unknown,
        Status::Queue,
        Status::Progress,
        Status::Success,
        Status::Failure,
        Status::Skipped,
        Status::Exited,
        Status::Stopped,
    ];

    /// Integer stored in the `status_code` column.
    pub fn code(self) -> i64 {
        match self {
            Status::Unknown => 0,
            Status::Queue => 1,
            Status::Progress => 2,
            Status::Success => 3,
            Status::Failure => 4,
            Status::Skipped => 5,
            Status::Exited => 6,
            Status::Stopped => 7,
        }
    }

    /// Inverse of [`Status::code`]; unrecognised codes decode as Unknown.
    pub fn from_code(code: i64) -> Self {
        Status::ALL
            .into_iter()
            .find(|s| s.code() == code)
            .unwrap_or(Status::Unknown)
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Queue | Status::Progress)
    }

    /// Whether this status says anything about a real run. Unknown and Queue
    /// are placeholders that a more specific status should win over.
    pub fn is_specific(self) -> bool {
        !matches!(self, Status::Unknown | Status::Queue)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Unknown => "unknown",
            Status::Queue => "queue",
            Status::Progress => "progress",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Skipped => "skipped",
            Status::Exited => "exited",
            Status::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.to_string() == s)
            .ok_or_else(|| format!("unknown status: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let codes: Vec<i64> = Status::ALL.iter().map(|s| s.code()).collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4, 5, 6, 7]);
        for status in Status::ALL {
            assert_eq!(Status::from_code(status.code()), status);
        }
    }

    #[test]
    fn unknown_codes_decode_as_unknown() {
        assert_eq!(Status::from_code(42), Status::Unknown);
        assert_eq!(Status::from_code(-1), Status::Unknown);
    }

    #[test]
    fn only_queue_and_progress_are_non_terminal() {
        let open: Vec<Status> = Status::ALL
            .into_iter()
            .filter(|s| !s.is_terminal())
            .collect();
        assert_eq!(open, vec![Status::Queue, Status::Progress]);
    }

    #[test]
    fn display_round_trips_through_from_str() {
        assert_eq!("exited".parse::<Status>(), Ok(Status::Exited));
        assert!("running".parse::<Status>().is_err());
    }
}
