//! Persistent, multi-process job store.
//!
//! A queue is a directory holding a SQLite database plus per-job output
//! files. Every mutation goes through a `BEGIN IMMEDIATE` transaction (see
//! [`retry::with_write_tx`]), which is the one serialization point shared by
//! clients and feeders running in separate processes.

mod filter;
mod jobs;
mod meta;
mod retry;
mod schema;

pub use filter::{JobCursor, JobFilter};
pub use jobs::{JobCounts, QueueSnapshot};
pub use meta::FeederRegistration;
pub use retry::LockRetry;

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};

use crate::clock::{Clock, SystemClock};
use crate::error::QueueError;
use crate::state_machine::JobId;

pub const DB_FILE: &str = "db";
pub const CONFIG_FILE: &str = "rq.toml";
const STDOUT_DIR: &str = "stdout";
const STDERR_DIR: &str = "stderr";

/// Handle to one queue directory. Each handle owns its own connection.
#[derive(Debug)]
pub struct Queue {
    conn: Connection,
    root: PathBuf,
    clock: Arc<dyn Clock>,
    retry: LockRetry,
}

impl Queue {
    /// Initialize an empty queue at `root`.
    ///
    /// Fails with [`QueueError::AlreadyExists`] if a queue database is already
    /// there. The database file is created with `create_new`, so two racing
    /// creators cannot both succeed.
    pub fn create(root: impl AsRef<Path>) -> Result<Self, QueueError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let db_path = root.join(DB_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&db_path) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(QueueError::AlreadyExists(root));
            }
            Err(err) => return Err(err.into()),
        }

        let retry = LockRetry::default();
        let init = || -> Result<Connection, QueueError> {
            std::fs::create_dir_all(root.join(STDOUT_DIR))?;
            std::fs::create_dir_all(root.join(STDERR_DIR))?;
            let conn = connect(&db_path, &retry)?;
            schema::install(&conn)?;
            Ok(conn)
        };
        let conn = match init() {
            Ok(conn) => conn,
            Err(err) => {
                let _ = std::fs::remove_file(&db_path);
                return Err(err);
            }
        };

        tracing::debug!(queue = %root.display(), "queue created");
        Ok(Self {
            conn,
            root,
            clock: Arc::new(SystemClock),
            retry,
        })
    }

    /// Open an existing queue. A missing database is [`QueueError::NotFound`].
    pub fn open(root: impl AsRef<Path>) -> Result<Self, QueueError> {
        let root = root.as_ref().to_path_buf();
        let db_path = root.join(DB_FILE);
        if !db_path.is_file() {
            return Err(QueueError::NotFound(format!("queue {}", root.display())));
        }

        let retry = LockRetry::default();
        let conn = connect(&db_path, &retry)?;
        schema::check_version(&conn)?;

        Ok(Self {
            conn,
            root,
            clock: Arc::new(SystemClock),
            retry,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_lock_retry(mut self, retry: LockRetry) -> Result<Self, QueueError> {
        self.conn.busy_timeout(retry.busy_timeout())?;
        self.retry = retry;
        Ok(self)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where a job's standard output is captured.
    pub fn stdout_path(&self, id: JobId) -> PathBuf {
        self.root.join(STDOUT_DIR).join(id.to_string())
    }

    /// Where a job's standard error is captured.
    pub fn stderr_path(&self, id: JobId) -> PathBuf {
        self.root.join(STDERR_DIR).join(id.to_string())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn connect(db_path: &Path, retry: &LockRetry) -> Result<Connection, QueueError> {
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(retry.busy_timeout())?;
    // WAL keeps readers off the writer's lock and survives a killed writer.
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}
