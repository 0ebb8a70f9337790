use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::state_machine::{Event, JobId, JobState};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cannot {event}: job {id} is {from}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        event: Event,
    },

    #[error("queue is locked, gave up after {attempts} attempts")]
    LockTimeout { attempts: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl QueueError {
    /// True for SQLite busy/locked results, the only errors worth retrying.
    pub fn is_contention(&self) -> bool {
        match self {
            QueueError::Sql(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Errors the feeder shrugs off and retries on its next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::LockTimeout { .. }) || self.is_contention()
    }
}
