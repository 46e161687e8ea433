//! Job status state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a job instance.
///
/// The serialized form (`"new"`, `"scheduled"`, ...) is what the store
/// persists and what external tooling filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, waiting to be dispatched.
    New,
    /// Waiting for its schedule time.
    Scheduled,
    /// Handler is executing.
    Running,
    /// Handler returned successfully.
    Done,
    /// Handler returned an error or panicked.
    Exception,
    /// Stopped by a kill request while running.
    Killed,
    /// Withdrawn before it started.
    Cancelled,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 7] = [
        Self::New,
        Self::Scheduled,
        Self::Running,
        Self::Done,
        Self::Exception,
        Self::Killed,
        Self::Cancelled,
    ];

    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            // Not yet started
            (New, Running) | (New, Scheduled) | (New, Cancelled) |
            (Scheduled, Running) | (Scheduled, Cancelled) |
            // Running
            (Running, Done) | (Running, Exception) | (Running, Killed) |
            // Rerun
            (Done, New) | (Exception, New) | (Killed, New) | (Cancelled, New)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Exception | Self::Killed | Self::Cancelled
        )
    }

    /// Whether the consumer may start the handler from this status.
    pub fn is_startable(&self) -> bool {
        matches!(self, Self::New | Self::Scheduled)
    }

    /// Wire value stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Done => "done",
            Self::Exception => "exception",
            Self::Killed => "killed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_valid() {
        assert!(JobStatus::New.can_transition_to(JobStatus::Running));
        assert!(JobStatus::New.can_transition_to(JobStatus::Scheduled));
        assert!(JobStatus::Scheduled.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Scheduled.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Done));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Exception));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Killed));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!JobStatus::Done.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::New));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Scheduled.can_transition_to(JobStatus::Done));
        assert!(!JobStatus::New.can_transition_to(JobStatus::Killed));
    }

    #[test]
    fn only_terminal_statuses_rerun() {
        for status in JobStatus::ALL {
            assert_eq!(
                status.can_transition_to(JobStatus::New),
                status.is_terminal(),
                "rerun from {status}"
            );
        }
    }

    #[test]
    fn no_self_transitions() {
        for status in JobStatus::ALL {
            assert!(!status.can_transition_to(status), "{status} -> {status}");
        }
    }

    #[test]
    fn startable_statuses() {
        let startable: Vec<_> = JobStatus::ALL
            .into_iter()
            .filter(JobStatus::is_startable)
            .collect();
        assert_eq!(startable, vec![JobStatus::New, JobStatus::Scheduled]);
    }

    #[test]
    fn wire_values() {
        assert_eq!(JobStatus::Cancelled.to_string(), "cancelled");
        assert_eq!("exception".parse::<JobStatus>().unwrap(), JobStatus::Exception);
        assert!("stuck".parse::<JobStatus>().is_err());
        let json = serde_json::to_string(&JobStatus::Scheduled).unwrap();
        assert_eq!(json, "\"scheduled\"");
    }
}
