//! The `status` document.
//!
//! Built from one [`QueueSnapshot`], so the numbers always agree with each
//! other even while jobs are being submitted and finished.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::QueueError;
use crate::queue::{JobCounts, Queue, QueueSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub jobs: JobCounts,
    #[serde(skip_serializing_if = "Temporal::is_empty")]
    pub temporal: Temporal,
    pub exit_status: ExitStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feeder: Option<FeederStatus>,
    pub shutdown_requested: bool,
}

/// Outcome tallies of finished jobs.
///
/// `ok` and `successes` both count jobs that exited 0; `failures` counts the
/// rest. A queue is healthy while `failures` stays at 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExitStatus {
    pub successes: u64,
    pub failures: u64,
    pub ok: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Temporal {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_pending: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_finished: Option<DateTime<Utc>>,
}

impl Temporal {
    fn is_empty(&self) -> bool {
        self.oldest_pending.is_none() && self.last_finished.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeederStatus {
    pub pid: u32,
    pub heartbeat: DateTime<Utc>,
    pub stale: bool,
}

impl StatusReport {
    pub fn collect(queue: &Queue) -> Result<Self, QueueError> {
        Ok(Self::from_snapshot(&queue.snapshot()?))
    }

    pub fn from_snapshot(snapshot: &QueueSnapshot) -> Self {
        let counts = snapshot.counts;
        Self {
            jobs: counts,
            temporal: Temporal {
                oldest_pending: snapshot.oldest_pending,
                last_finished: snapshot.last_finished,
            },
            exit_status: ExitStatus {
                successes: counts.success,
                failures: counts.failure,
                ok: counts.success,
            },
            feeder: snapshot.feeder.as_ref().map(|feeder| FeederStatus {
                pid: feeder.pid,
                heartbeat: feeder.heartbeat,
                stale: feeder.is_stale(snapshot.taken_at),
            }),
            shutdown_requested: snapshot.shutdown_requested,
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
