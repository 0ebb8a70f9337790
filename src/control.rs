//! Client operations: create, submit, status, query, list, delete, shutdown.
//!
//! Each call is a short synchronous round trip against the store and never
//! waits on the feeder. [`Control`] owns its own [`Queue`] handle, so many
//! clients and a feeder can work on the same queue at once.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::QueueError;
use crate::queue::{JobFilter, Queue};
use crate::shutdown;
use crate::state_machine::{Job, JobId, JobState, NewJob};
use crate::status::StatusReport;

/// Control surface for one queue.
#[derive(Debug)]
pub struct Control {
    queue: Queue,
}

/// One job as shown to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub jid: JobId,
    pub state: JobState,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub submitted: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<PathBuf>,
}

impl JobSummary {
    fn render(queue: &Queue, job: Job) -> Self {
        let started = job.started_at.is_some();
        Self {
            jid: job.id,
            state: job.state,
            elapsed: job
                .elapsed()
                .map(|elapsed| elapsed.num_milliseconds() as f64 / 1000.0),
            stdout: started.then(|| queue.stdout_path(job.id)),
            stderr: started.then(|| queue.stderr_path(job.id)),
            command: job.command,
            tag: job.tag,
            submitted: job.submitted_at,
            started: job.started_at,
            finished: job.finished_at,
            exit_status: job.exit_code,
            pid: job.pid,
        }
    }
}

/// Acknowledges a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub jid: JobId,
    pub command: String,
}

impl Control {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        Ok(Self {
            queue: Queue::create(path)?,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        Ok(Self {
            queue: Queue::open(path)?,
        })
    }

    pub fn from_queue(queue: Queue) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn submit(&mut self, command: impl Into<String>) -> Result<JobId, QueueError> {
        self.queue.insert(NewJob::new(command))
    }

    /// Submit several commands atomically; ids are consecutive.
    pub fn submit_many(
        &mut self,
        commands: Vec<String>,
        tag: Option<String>,
    ) -> Result<Vec<SubmitReceipt>, QueueError> {
        if commands.is_empty() {
            return Err(QueueError::InvalidArgument("nothing to submit".into()));
        }
        let jobs: Vec<NewJob> = commands
            .iter()
            .map(|command| NewJob::new(command.clone()).tagged(tag.clone()))
            .collect();
        let ids = self.queue.insert_many(&jobs)?;
        tracing::debug!(count = ids.len(), "jobs submitted");

        Ok(ids
            .into_iter()
            .zip(commands)
            .map(|(jid, command)| SubmitReceipt { jid, command })
            .collect())
    }

    pub fn status(&self) -> Result<StatusReport, QueueError> {
        StatusReport::collect(&self.queue)
    }

    /// Jobs matching `key=value` terms, e.g. `state=pending`.
    pub fn query<S: AsRef<str>>(&self, terms: &[S]) -> Result<Vec<JobSummary>, QueueError> {
        let filter = JobFilter::parse(terms)?;
        self.collect(filter)
    }

    /// Every job; tombstones only with `include_deleted`.
    pub fn list(&self, include_deleted: bool) -> Result<Vec<JobSummary>, QueueError> {
        self.collect(JobFilter {
            include_deleted,
            ..JobFilter::default()
        })
    }

    /// Tombstone a PENDING job.
    ///
    /// Anything else comes back as [`QueueError::InvalidTransition`], whose
    /// message reads `cannot delete: job <id> is <state>`.
    pub fn delete(&mut self, id: JobId) -> Result<JobSummary, QueueError> {
        let job = self.queue.delete(id)?;
        tracing::debug!(job_id = id, "job deleted");
        Ok(JobSummary::render(&self.queue, job))
    }

    pub fn shutdown(&mut self) -> Result<StatusReport, QueueError> {
        shutdown::request(&mut self.queue)
    }

    fn collect(&self, filter: JobFilter) -> Result<Vec<JobSummary>, QueueError> {
        self.queue
            .list(filter)
            .map(|job| job.map(|job| JobSummary::render(&self.queue, job)))
            .collect()
    }
}

/// One command per non-empty line; `#` starts a comment line.
pub fn read_commands(reader: impl BufRead) -> std::io::Result<Vec<String>> {
    let mut commands = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        commands.push(trimmed.to_string());
    }
    Ok(commands)
}
