//! Shared status vocabulary for environments, trials and service operations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an environment, trial, or service operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Unknown,
    Pending,
    Ready,
    Running,
    Succeeded,
    Canceled,
    Failed,
    TimedOut,
}

impl Status {
    pub const ALL: [Status; 8] = [
        Status::Unknown,
        Status::Pending,
        Status::Ready,
        Status::Running,
        Status::Succeeded,
        Status::Canceled,
        Status::Failed,
        Status::TimedOut,
    ];

    /// PENDING, READY, RUNNING or SUCCEEDED.
    pub fn is_good(self) -> bool {
        matches!(
            self,
            Status::Pending | Status::Ready | Status::Running | Status::Succeeded
        )
    }

    /// SUCCEEDED, CANCELED, FAILED or TIMED_OUT.
    pub fn is_completed(self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::Canceled | Status::Failed | Status::TimedOut
        )
    }

    pub fn is_pending(self) -> bool {
        self == Status::Pending
    }

    pub fn is_ready(self) -> bool {
        self == Status::Ready
    }

    /// Still provisioning: PENDING or READY.
    pub fn is_in_setup(self) -> bool {
        matches!(self, Status::Pending | Status::Ready)
    }

    pub fn is_running(self) -> bool {
        self == Status::Running
    }

    pub fn is_succeeded(self) -> bool {
        self == Status::Succeeded
    }

    pub fn is_canceled(self) -> bool {
        self == Status::Canceled
    }

    pub fn is_failed(self) -> bool {
        self == Status::Failed
    }

    pub fn is_timed_out(self) -> bool {
        self == Status::TimedOut
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Unknown => "UNKNOWN",
            Status::Pending => "PENDING",
            Status::Ready => "READY",
            Status::Running => "RUNNING",
            Status::Succeeded => "SUCCEEDED",
            Status::Canceled => "CANCELED",
            Status::Failed => "FAILED",
            Status::TimedOut => "TIMED_OUT",
        }
    }

    /// Parse the persisted form. Unrecognized strings map to `Unknown`.
    pub fn parse(s: &str) -> Status {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .unwrap_or(Status::Unknown)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Status {
    fn from(s: &str) -> Self {
        Status::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn good_and_completed_sets() {
        let good: Vec<Status> = Status::ALL.into_iter().filter(|s| s.is_good()).collect();
        assert_eq!(
            good,
            vec![Status::Pending, Status::Ready, Status::Running, Status::Succeeded]
        );

        let completed: Vec<Status> = Status::ALL
            .into_iter()
            .filter(|s| s.is_completed())
            .collect();
        assert_eq!(
            completed,
            vec![
                Status::Succeeded,
                Status::Canceled,
                Status::Failed,
                Status::TimedOut
            ]
        );
        assert!(!Status::Unknown.is_good());
        assert!(!Status::Unknown.is_completed());
    }

    #[test]
    fn timed_out_is_not_failed() {
        assert!(Status::TimedOut.is_timed_out());
        assert!(!Status::TimedOut.is_failed());
        assert!(!Status::Failed.is_timed_out());
    }

    #[test]
    fn parse_round_trip_and_unknown() {
        for status in Status::ALL {
            assert_eq!(Status::parse(status.as_str()), status);
        }
        assert_eq!(Status::parse("timed_out"), Status::TimedOut);
        assert_eq!(Status::parse("bogus"), Status::Unknown);
    }

    #[test]
    fn serde_uses_persisted_names() {
        let json = serde_json::to_string(&Status::TimedOut).unwrap();
        assert_eq!(json, "\"TIMED_OUT\"");
        let back: Status = serde_json::from_str("\"SUCCEEDED\"").unwrap();
        assert_eq!(back, Status::Succeeded);
    }
}
