use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row, Transaction, params};
use serde::Serialize;

use super::Queue;
use super::meta::{self, FeederRegistration};
use super::retry::with_write_tx;
use crate::clock::{from_millis, to_millis};
use crate::error::QueueError;
use crate::state_machine::{Event, Job, JobId, JobState, NewJob, StateMachine};

pub(crate) const JOB_COLUMNS: &str =
    "id, command, tag, state, submitted_at_ms, started_at_ms, finished_at_ms, exit_code, pid";

/// Point-in-time job totals, read in one statement.
///
/// `total` excludes tombstones: it is always
/// `pending + running + success + failure`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: u64,
    pub running: u64,
    pub success: u64,
    pub failure: u64,
    pub deleted: u64,
    pub total: u64,
}

impl JobCounts {
    fn new(pending: u64, running: u64, success: u64, failure: u64, deleted: u64) -> Self {
        Self {
            pending,
            running,
            success,
            failure,
            deleted,
            total: pending + running + success + failure,
        }
    }

    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Running => self.running,
            JobState::Success => self.success,
            JobState::Failure => self.failure,
            JobState::Deleted => self.deleted,
        }
    }
}

/// Everything `status` needs, read under a single snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub counts: JobCounts,
    pub oldest_pending: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub shutdown_requested: bool,
    pub feeder: Option<FeederRegistration>,
    pub taken_at: DateTime<Utc>,
}

const COUNTS_SQL: &str = "
SELECT
    COALESCE(SUM(state = 'pending'), 0),
    COALESCE(SUM(state = 'running'), 0),
    COALESCE(SUM(state = 'success'), 0),
    COALESCE(SUM(state = 'failure'), 0),
    COALESCE(SUM(state = 'deleted'), 0),
    MIN(CASE WHEN state = 'pending' THEN submitted_at_ms END),
    MAX(finished_at_ms)
FROM jobs";

impl Queue {
    /// Append one PENDING job and return its id.
    pub fn insert(&mut self, job: NewJob) -> Result<JobId, QueueError> {
        let ids = self.insert_many(std::slice::from_ref(&job))?;
        Ok(ids[0])
    }

    /// Append several jobs in one transaction; ids come back in input order
    /// and are consecutive.
    pub fn insert_many(&mut self, jobs: &[NewJob]) -> Result<Vec<JobId>, QueueError> {
        let now = to_millis(self.now());
        with_write_tx(&mut self.conn, &self.retry, |tx| {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO jobs(command, tag, state, submitted_at_ms) VALUES (?1, ?2, ?3, ?4)",
            )?;
            let mut ids = Vec::with_capacity(jobs.len());
            for job in jobs {
                stmt.execute(params![job.command, job.tag, JobState::Pending.as_str(), now])?;
                ids.push(tx.last_insert_rowid());
            }
            Ok(ids)
        })
    }

    /// Atomically move the oldest PENDING job to RUNNING and return it.
    ///
    /// The select and the update share one immediate transaction, so a job
    /// deleted or claimed by another process in between is never handed out.
    pub fn claim_next_pending(&mut self) -> Result<Option<Job>, QueueError> {
        let now = to_millis(self.now());
        with_write_tx(&mut self.conn, &self.retry, |tx| {
            let next: Option<JobId> = tx
                .query_row(
                    "SELECT id FROM jobs WHERE state = 'pending' \
                     ORDER BY submitted_at_ms, id LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(id) = next else {
                return Ok(None);
            };

            let to = StateMachine::transition(id, JobState::Pending, Event::Claim)?;
            let changed = tx.execute(
                "UPDATE jobs SET state = ?2, started_at_ms = ?3 \
                 WHERE id = ?1 AND state = 'pending'",
                params![id, to.as_str(), now],
            )?;
            if changed != 1 {
                return Ok(None);
            }
            load(tx, id).map(Some)
        })
    }

    /// Remember the OS pid of a launched job.
    pub fn record_launch(&mut self, id: JobId, pid: u32) -> Result<(), QueueError> {
        with_write_tx(&mut self.conn, &self.retry, |tx| {
            tx.execute(
                "UPDATE jobs SET pid = ?2 WHERE id = ?1 AND state = 'running'",
                params![id, i64::from(pid)],
            )?;
            Ok(())
        })
    }

    /// RUNNING → SUCCESS (exit code 0) or FAILURE (anything else).
    pub fn complete(&mut self, id: JobId, exit_code: i32) -> Result<Job, QueueError> {
        let now = to_millis(self.now());
        with_write_tx(&mut self.conn, &self.retry, |tx| {
            let from = current_state(tx, id)?;
            let to = StateMachine::transition(id, from, Event::Finish { exit_code })?;
            tx.execute(
                "UPDATE jobs SET state = ?2, finished_at_ms = ?3, exit_code = ?4 WHERE id = ?1",
                params![id, to.as_str(), now, exit_code],
            )?;
            load(tx, id)
        })
    }

    /// PENDING → DELETED. Running and finished jobs are refused.
    pub fn delete(&mut self, id: JobId) -> Result<Job, QueueError> {
        with_write_tx(&mut self.conn, &self.retry, |tx| {
            let from = current_state(tx, id)?;
            let to = StateMachine::transition(id, from, Event::Delete)?;
            tx.execute(
                "UPDATE jobs SET state = ?2 WHERE id = ?1",
                params![id, to.as_str()],
            )?;
            load(tx, id)
        })
    }

    pub fn get(&self, id: JobId) -> Result<Job, QueueError> {
        self.conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                job_from_row,
            )
            .optional()?
            .ok_or_else(|| QueueError::NotFound(format!("job {id}")))
    }

    /// Aggregate counts from a single SELECT.
    pub fn counts(&self) -> Result<JobCounts, QueueError> {
        let (counts, _, _) = self.conn.query_row(COUNTS_SQL, [], counts_from_row)?;
        Ok(counts)
    }

    /// Counts, temporal bounds and control metadata from one read transaction.
    pub fn snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        let tx = self.conn.unchecked_transaction()?;
        let (counts, oldest_pending, last_finished) =
            tx.query_row(COUNTS_SQL, [], counts_from_row)?;
        let shutdown_requested = meta::read_flag(&tx, meta::SHUTDOWN_KEY)?;
        let feeder = meta::read_feeder(&tx)?;
        tx.finish()?;

        Ok(QueueSnapshot {
            counts,
            oldest_pending: oldest_pending.map(from_millis),
            last_finished: last_finished.map(from_millis),
            shutdown_requested,
            feeder,
            taken_at: self.now(),
        })
    }
}

fn current_state(tx: &Transaction<'_>, id: JobId) -> Result<JobState, QueueError> {
    let state: Option<String> = tx
        .query_row("SELECT state FROM jobs WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    state
        .ok_or_else(|| QueueError::NotFound(format!("job {id}")))?
        .parse()
}

fn load(tx: &Transaction<'_>, id: JobId) -> Result<Job, QueueError> {
    Ok(tx.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        params![id],
        job_from_row,
    )?)
}

type CountsRow = (JobCounts, Option<i64>, Option<i64>);

fn counts_from_row(row: &Row<'_>) -> rusqlite::Result<CountsRow> {
    let count = |idx: usize| -> rusqlite::Result<u64> {
        let value: i64 = row.get(idx)?;
        Ok(u64::try_from(value).unwrap_or(0))
    };
    Ok((
        JobCounts::new(count(0)?, count(1)?, count(2)?, count(3)?, count(4)?),
        row.get(5)?,
        row.get(6)?,
    ))
}

pub(crate) fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let state: String = row.get(3)?;
    let state = state
        .parse::<JobState>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(err)))?;
    let pid: Option<i64> = row.get(8)?;

    Ok(Job {
        id: row.get(0)?,
        command: row.get(1)?,
        tag: row.get(2)?,
        state,
        submitted_at: from_millis(row.get(4)?),
        started_at: row.get::<_, Option<i64>>(5)?.map(from_millis),
        finished_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
        exit_code: row.get(7)?,
        pid: pid.and_then(|pid| u32::try_from(pid).ok()),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::clock::ManualClock;

    fn queue() -> (tempfile::TempDir, Queue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::create(dir.path().join("q")).unwrap();
        (dir, queue)
    }

    #[test]
    fn ids_are_sequential_from_one() {
        let (_dir, mut queue) = queue();
        assert_eq!(queue.insert(NewJob::new("/bin/true")).unwrap(), 1);
        assert_eq!(queue.insert(NewJob::new("/bin/true")).unwrap(), 2);
        let ids = queue
            .insert_many(&[NewJob::new("a"), NewJob::new("b"), NewJob::new("c")])
            .unwrap();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn ids_are_never_reused_after_delete() {
        let (_dir, mut queue) = queue();
        let first = queue.insert(NewJob::new("a")).unwrap();
        queue.delete(first).unwrap();
        assert_eq!(queue.insert(NewJob::new("b")).unwrap(), first + 1);
    }

    #[test]
    fn claim_takes_oldest_pending_first() {
        let (_dir, mut queue) = queue();
        queue.insert(NewJob::new("one")).unwrap();
        queue.insert(NewJob::new("two")).unwrap();

        let first = queue.claim_next_pending().unwrap().unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(first.state, JobState::Running);
        assert!(first.started_at.is_some());

        let second = queue.claim_next_pending().unwrap().unwrap();
        assert_eq!(second.id, 2);
        assert!(queue.claim_next_pending().unwrap().is_none());
    }

    #[test]
    fn claim_skips_deleted_jobs() {
        let (_dir, mut queue) = queue();
        queue.insert(NewJob::new("one")).unwrap();
        queue.insert(NewJob::new("two")).unwrap();
        queue.delete(1).unwrap();

        let claimed = queue.claim_next_pending().unwrap().unwrap();
        assert_eq!(claimed.id, 2);
        assert!(queue.claim_next_pending().unwrap().is_none());
    }

    #[test]
    fn complete_sets_outcome_and_timestamps() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let (_dir, queue) = queue();
        let mut queue = queue.with_clock(Arc::new(clock.clone()));

        queue.insert(NewJob::new("ok")).unwrap();
        queue.insert(NewJob::new("bad")).unwrap();
        clock.advance(chrono::Duration::seconds(5));
        queue.claim_next_pending().unwrap();
        queue.claim_next_pending().unwrap();
        clock.advance(chrono::Duration::seconds(10));

        let ok = queue.complete(1, 0).unwrap();
        assert_eq!(ok.state, JobState::Success);
        assert_eq!(ok.exit_code, Some(0));
        assert_eq!(ok.submitted_at, start);
        assert_eq!(ok.started_at, Some(start + chrono::Duration::seconds(5)));
        assert_eq!(ok.finished_at, Some(start + chrono::Duration::seconds(15)));

        let bad = queue.complete(2, 3).unwrap();
        assert_eq!(bad.state, JobState::Failure);
        assert_eq!(bad.exit_code, Some(3));
    }

    #[test]
    fn complete_requires_running() {
        let (_dir, mut queue) = queue();
        queue.insert(NewJob::new("x")).unwrap();
        let err = queue.complete(1, 0).unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                id: 1,
                from: JobState::Pending,
                ..
            }
        ));

        queue.claim_next_pending().unwrap();
        queue.complete(1, 0).unwrap();
        let err = queue.complete(1, 0).unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: JobState::Success,
                ..
            }
        ));
    }

    #[test]
    fn delete_only_pending() {
        let (_dir, mut queue) = queue();
        queue.insert(NewJob::new("running")).unwrap();
        queue.insert(NewJob::new("pending")).unwrap();
        queue.claim_next_pending().unwrap();

        let err = queue.delete(1).unwrap_err();
        assert_eq!(err.to_string(), "cannot delete: job 1 is running");

        let deleted = queue.delete(2).unwrap();
        assert_eq!(deleted.state, JobState::Deleted);
        assert!(matches!(
            queue.delete(2).unwrap_err(),
            QueueError::InvalidTransition {
                from: JobState::Deleted,
                ..
            }
        ));
        assert!(matches!(queue.delete(99).unwrap_err(), QueueError::NotFound(_)));
    }

    #[test]
    fn counts_exclude_tombstones_from_total() {
        let (_dir, mut queue) = queue();
        assert_eq!(queue.counts().unwrap(), JobCounts::default());

        for command in ["a", "b", "c", "d", "e"] {
            queue.insert(NewJob::new(command)).unwrap();
        }
        queue.claim_next_pending().unwrap();
        queue.claim_next_pending().unwrap();
        queue.claim_next_pending().unwrap();
        queue.complete(1, 0).unwrap();
        queue.complete(2, 1).unwrap();
        queue.delete(5).unwrap();

        let counts = queue.counts().unwrap();
        assert_eq!(
            counts,
            JobCounts {
                pending: 1,
                running: 1,
                success: 1,
                failure: 1,
                deleted: 1,
                total: 4,
            }
        );
        assert_eq!(
            counts.pending + counts.running + counts.success + counts.failure,
            counts.total
        );
        assert_eq!(counts.get(JobState::Deleted), 1);
    }

    #[test]
    fn snapshot_reports_temporal_bounds_and_flags() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let (_dir, queue) = queue();
        let mut queue = queue.with_clock(Arc::new(clock.clone()));

        let empty = queue.snapshot().unwrap();
        assert!(empty.oldest_pending.is_none());
        assert!(empty.last_finished.is_none());
        assert!(!empty.shutdown_requested);

        queue.insert(NewJob::new("a")).unwrap();
        clock.advance(chrono::Duration::seconds(1));
        queue.insert(NewJob::new("b")).unwrap();
        queue.claim_next_pending().unwrap();
        clock.advance(chrono::Duration::seconds(1));
        queue.complete(1, 0).unwrap();
        queue.request_shutdown().unwrap();

        let snapshot = queue.snapshot().unwrap();
        assert_eq!(snapshot.counts.total, 2);
        assert_eq!(
            snapshot.oldest_pending,
            Some(start + chrono::Duration::seconds(1))
        );
        assert_eq!(
            snapshot.last_finished,
            Some(start + chrono::Duration::seconds(2))
        );
        assert!(snapshot.shutdown_requested);
    }

    #[test]
    fn concurrent_claims_never_share_a_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q");
        let mut queue = Queue::create(&path).unwrap();
        let jobs: Vec<NewJob> = (0..60).map(|n| NewJob::new(format!("job {n}"))).collect();
        queue.insert_many(&jobs).unwrap();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let mut queue = Queue::open(&path).unwrap();
                    let mut claimed = Vec::new();
                    while let Some(job) = queue.claim_next_pending().unwrap() {
                        claimed.push(job.id);
                    }
                    claimed
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for worker in workers {
            for id in worker.join().unwrap() {
                assert!(seen.insert(id), "job {id} claimed twice");
                total += 1;
            }
        }
        assert_eq!(total, 60);
        assert_eq!(queue.counts().unwrap().running, 60);
    }

    #[test]
    fn concurrent_inserts_get_distinct_contiguous_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q");
        let queue = Queue::create(&path).unwrap();

        let submitters: Vec<_> = (0..4)
            .map(|n| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let mut queue = Queue::open(&path).unwrap();
                    (0..25)
                        .map(|i| queue.insert(NewJob::new(format!("echo {n}-{i}"))).unwrap())
                        .collect::<Vec<JobId>>()
                })
            })
            .collect();

        let mut ids = Vec::new();
        for submitter in submitters {
            let mine = submitter.join().unwrap();
            assert!(mine.windows(2).all(|w| w[0] < w[1]), "ids went backwards: {mine:?}");
            ids.extend(mine);
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=100).collect::<Vec<JobId>>());
        assert_eq!(queue.counts().unwrap().pending, 100);
    }

    #[test]
    fn record_launch_stores_pid() {
        let (_dir, mut queue) = queue();
        queue.insert(NewJob::new("x")).unwrap();
        queue.claim_next_pending().unwrap();
        queue.record_launch(1, 4242).unwrap();
        assert_eq!(queue.get(1).unwrap().pid, Some(4242));
    }
}
