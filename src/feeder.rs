use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::FeedConfig;
use crate::error::QueueError;
use crate::executor::{JobExecutor, LAUNCH_FAILED_EXIT_CODE, OutputPaths, RunningJob};
use crate::pacer::Pacer;
use crate::queue::Queue;
use crate::state_machine::{Job, JobId};

/// Tallies for one feeder run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub claimed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub launch_failures: u64,
    pub cycles: u64,
}

/// What the loop should do after a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// Sleep, then poll again.
    Continue,
    /// Stop was requested and no job is running or awaiting its completion write.
    Exit,
}

/// Claims PENDING jobs, runs them as child processes and records how they end.
pub struct Feeder {
    queue: Queue,
    executor: JobExecutor,
    pacer: Pacer,
    max_feed: usize,
    stale_after: chrono::Duration,
    pid: u32,
    stop: CancellationToken,
    in_flight: Vec<RunningJob>,
    reaped: Vec<(JobId, i32)>,
    draining: bool,
    stats: FeedStats,
}

impl Feeder {
    pub fn new(queue: Queue, config: &FeedConfig, stop: CancellationToken) -> Self {
        Self {
            queue,
            executor: JobExecutor::default(),
            pacer: Pacer::new(config.min_sleep(), config.max_sleep()),
            max_feed: config.max_feed.max(1),
            stale_after: config.stale_after(),
            pid: std::process::id(),
            stop,
            in_flight: Vec::new(),
            reaped: Vec::new(),
            draining: false,
            stats: FeedStats::default(),
        }
    }

    pub fn with_pacer(mut self, pacer: Pacer) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn with_executor(mut self, executor: JobExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn stats(&self) -> FeedStats {
        self.stats
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Run cycles until a stop is requested and every in-flight job has ended.
    ///
    /// Starting a feeder clears a shutdown flag left by an earlier run.
    pub async fn run(mut self) -> Result<FeedStats, QueueError> {
        self.queue.clear_shutdown()?;
        self.queue.register_feeder(self.pid, self.stale_after)?;
        tracing::info!(
            queue = %self.queue.root().display(),
            pid = self.pid,
            max_feed = self.max_feed,
            "feeder started"
        );

        let outcome = loop {
            match self.cycle() {
                Ok(Cycle::Exit) => break Ok(()),
                Ok(Cycle::Continue) => {}
                Err(err) => break Err(err),
            }
            let delay = self.pacer.next_delay();
            pause(delay, &self.stop).await;
        };

        if let Err(err) = self.queue.unregister_feeder(self.pid) {
            tracing::warn!(pid = self.pid, error = %err, "could not unregister feeder");
        }
        if let Err(err) = outcome {
            tracing::error!(in_flight = self.in_flight.len(), error = %err, "feeder aborted");
            return Err(err);
        }
        tracing::info!(
            claimed = self.stats.claimed,
            succeeded = self.stats.succeeded,
            failed = self.stats.failed,
            "feeder stopped"
        );
        Ok(self.stats)
    }

    /// One polling cycle: check for stop, top up to `max_feed`, record
    /// finished jobs.
    ///
    /// Store contention never fails the cycle; the work is retried next time.
    pub fn cycle(&mut self) -> Result<Cycle, QueueError> {
        self.stats.cycles += 1;

        if self.stop_requested()? == Some(false) {
            self.poll_children();
            while self.in_flight.len() < self.max_feed {
                match transient(self.queue.claim_next_pending())? {
                    Some(Some(job)) => self.launch(job),
                    Some(None) | None => break,
                }
            }
        }

        self.poll_children();
        self.record_finished()?;
        transient(self.queue.heartbeat(self.pid))?;

        // Deferred completions still count as work in flight.
        if self.draining && self.in_flight.is_empty() && self.reaped.is_empty() {
            Ok(Cycle::Exit)
        } else {
            Ok(Cycle::Continue)
        }
    }

    /// Once a stop is observed the feeder keeps draining, even if the flag is
    /// cleared later. `None` means the flag could not be read this cycle, and
    /// nothing is claimed.
    fn stop_requested(&mut self) -> Result<Option<bool>, QueueError> {
        if self.draining {
            return Ok(Some(true));
        }
        let requested = if self.stop.is_cancelled() {
            Some(true)
        } else {
            transient(self.queue.shutdown_requested())?
        };
        if requested == Some(true) {
            tracing::info!(in_flight = self.in_flight.len(), "shutdown observed, no new claims");
            self.draining = true;
        }
        Ok(requested)
    }

    fn launch(&mut self, job: Job) {
        self.stats.claimed += 1;
        tracing::info!(job_id = job.id, "claimed job");

        let output = OutputPaths {
            stdout: self.queue.stdout_path(job.id),
            stderr: self.queue.stderr_path(job.id),
        };
        match self.executor.launch(&job, &output) {
            Ok(running) => {
                let pid = running.pid;
                self.in_flight.push(running);
                // The pid is bookkeeping only; the child is supervised either way.
                if let Some(pid) = pid {
                    if let Err(err) = self.queue.record_launch(job.id, pid) {
                        tracing::warn!(
                            job_id = job.id,
                            pid,
                            error = %err,
                            "could not record job pid"
                        );
                    }
                }
            }
            Err(err) => {
                tracing::error!(job_id = job.id, error = %err, "job failed to launch");
                self.stats.launch_failures += 1;
                self.reaped.push((job.id, LAUNCH_FAILED_EXIT_CODE));
            }
        }
    }

    /// Move every child that has exited from `in_flight` to `reaped`.
    fn poll_children(&mut self) {
        let mut index = 0;
        while index < self.in_flight.len() {
            match self.in_flight[index].try_reap() {
                Some(exit_code) => {
                    let done = self.in_flight.swap_remove(index);
                    self.reaped.push((done.id, exit_code));
                }
                None => index += 1,
            }
        }
    }

    fn record_finished(&mut self) -> Result<(), QueueError> {
        let reaped = std::mem::take(&mut self.reaped);
        let mut pending = Vec::new();

        for (id, exit_code) in reaped {
            match self.queue.complete(id, exit_code) {
                Ok(job) => {
                    if exit_code == 0 {
                        self.stats.succeeded += 1;
                    } else {
                        self.stats.failed += 1;
                    }
                    tracing::info!(job_id = id, exit_code, state = %job.state, "job finished");
                }
                Err(err @ QueueError::InvalidTransition { .. }) => {
                    tracing::warn!(job_id = id, error = %err, "ignoring completion");
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(job_id = id, error = %err, "queue busy, completion deferred");
                    pending.push((id, exit_code));
                }
                Err(err) => return Err(err),
            }
        }

        self.reaped = pending;
        Ok(())
    }
}

/// Sleep between cycles; a local stop signal cuts the pause short.
async fn pause(delay: Duration, stop: &CancellationToken) {
    tokio::select! {
        _ = sleep(delay) => {}
        _ = stop.cancelled() => {}
    }
}

/// Turn contention into `None` so the caller can retry next cycle.
fn transient<T>(result: Result<T, QueueError>) -> Result<Option<T>, QueueError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_transient() => {
            tracing::warn!(error = %err, "queue busy, retrying next cycle");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
