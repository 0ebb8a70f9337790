use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use super::job::JobId;
use crate::error::QueueError;

/// The five states of a queued job.
///
/// Each job flows through: PENDING → RUNNING → SUCCESS | FAILURE,
/// or leaves the queue early via PENDING → DELETED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Success,
    Failure,
    Deleted,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Running,
        JobState::Success,
        JobState::Failure,
        JobState::Deleted,
    ];

    /// Column value used by the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Failure => "failure",
            JobState::Deleted => "deleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failure | JobState::Deleted
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == lowered)
            .ok_or_else(|| QueueError::InvalidArgument(format!("unknown job state `{s}`")))
    }
}

/// Something that happens to a job and may move it to another state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A feeder takes exclusive ownership of a pending job.
    Claim,
    /// The job's process exited with the given code.
    Finish { exit_code: i32 },
    /// A client tombstones a job that never started.
    Delete,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Claim => write!(f, "claim"),
            Event::Finish { .. } => write!(f, "complete"),
            Event::Delete => write!(f, "delete"),
        }
    }
}

/// Decides which state transitions are legal.
pub struct StateMachine;

impl StateMachine {
    /// Compute the state a job in `from` moves to on `event`, if any.
    ///
    /// - `Pending` accepts `Claim` (→ `Running`) and `Delete` (→ `Deleted`).
    /// - `Running` only accepts `Finish`; exit code 0 is `Success`,
    ///   everything else is `Failure`.
    /// - Terminal states accept nothing.
    pub fn next(from: JobState, event: Event) -> Option<JobState> {
        match (from, event) {
            (JobState::Pending, Event::Claim) => Some(JobState::Running),
            (JobState::Pending, Event::Delete) => Some(JobState::Deleted),
            (JobState::Running, Event::Finish { exit_code: 0 }) => Some(JobState::Success),
            (JobState::Running, Event::Finish { .. }) => Some(JobState::Failure),
            _ => None,
        }
    }

    /// Like [`StateMachine::next`], but an illegal move is an error naming the job.
    pub fn transition(id: JobId, from: JobState, event: Event) -> Result<JobState, QueueError> {
        Self::next(from, event).ok_or(QueueError::InvalidTransition { id, from, event })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_can_be_claimed_or_deleted() {
        assert_eq!(
            StateMachine::next(JobState::Pending, Event::Claim),
            Some(JobState::Running)
        );
        assert_eq!(
            StateMachine::next(JobState::Pending, Event::Delete),
            Some(JobState::Deleted)
        );
        assert_eq!(
            StateMachine::next(JobState::Pending, Event::Finish { exit_code: 0 }),
            None
        );
    }

    #[test]
    fn running_only_finishes() {
        assert_eq!(
            StateMachine::next(JobState::Running, Event::Finish { exit_code: 0 }),
            Some(JobState::Success)
        );
        assert_eq!(
            StateMachine::next(JobState::Running, Event::Finish { exit_code: 2 }),
            Some(JobState::Failure)
        );
        assert_eq!(
            StateMachine::next(JobState::Running, Event::Finish { exit_code: -1 }),
            Some(JobState::Failure)
        );
        assert_eq!(StateMachine::next(JobState::Running, Event::Delete), None);
        assert_eq!(StateMachine::next(JobState::Running, Event::Claim), None);
    }

    #[test]
    fn terminal_states_are_final() {
        for state in [JobState::Success, JobState::Failure, JobState::Deleted] {
            assert!(state.is_terminal());
            for event in [Event::Claim, Event::Delete, Event::Finish { exit_code: 0 }] {
                assert_eq!(StateMachine::next(state, event), None, "{state} on {event}");
            }
        }
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn illegal_transition_names_the_job() {
        let err = StateMachine::transition(7, JobState::Success, Event::Finish { exit_code: 0 })
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                id: 7,
                from: JobState::Success,
                ..
            }
        ));
    }

    #[test]
    fn state_parses_case_insensitively() {
        assert_eq!("PENDING".parse::<JobState>().unwrap(), JobState::Pending);
        assert_eq!(" running ".parse::<JobState>().unwrap(), JobState::Running);
        assert!("finished".parse::<JobState>().is_err());
    }

    #[test]
    fn display_matches_store_column() {
        for state in JobState::ALL {
            assert_eq!(state.to_string(), state.as_str());
        }
    }
}
