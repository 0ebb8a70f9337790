use chrono::{DateTime, Utc};
use serde::Serialize;

use super::state::JobState;

/// Queue-assigned job identifier. Monotonic, never reused.
pub type JobId = i64;

/// A single unit of work in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub tag: Option<String>,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
}

impl Job {
    pub fn new(
        id: JobId,
        command: String,
        tag: Option<String>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            command,
            tag,
            state: JobState::Pending,
            submitted_at,
            started_at: None,
            finished_at: None,
            exit_code: None,
            pid: None,
        }
    }

    /// Wall time between start and finish, once both are known.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => Some(finished - started),
            _ => None,
        }
    }
}

/// A command waiting to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub command: String,
    pub tag: Option<String>,
}

impl NewJob {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            tag: None,
        }
    }

    pub fn tagged(mut self, tag: Option<String>) -> Self {
        self.tag = tag;
        self
    }
}
