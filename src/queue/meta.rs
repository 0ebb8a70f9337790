use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use super::Queue;
use super::retry::with_write_tx;
use crate::clock::{from_millis, to_millis};
use crate::error::QueueError;

pub(crate) const SHUTDOWN_KEY: &str = "shutdown_requested";
const FEEDER_PID_KEY: &str = "feeder_pid";
const FEEDER_HEARTBEAT_KEY: &str = "feeder_heartbeat_ms";
const FEEDER_STALE_AFTER_KEY: &str = "feeder_stale_after_ms";

/// The feeder currently attached to a queue, as it last reported itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeederRegistration {
    pub pid: u32,
    pub heartbeat: DateTime<Utc>,
    #[serde(skip)]
    pub stale_after: chrono::Duration,
}

impl FeederRegistration {
    /// A feeder that stopped heartbeating has most likely crashed.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.heartbeat > self.stale_after
    }
}

impl Queue {
    /// Persist the stop flag every feeder checks at the top of its cycle.
    pub fn request_shutdown(&mut self) -> Result<(), QueueError> {
        with_write_tx(&mut self.conn, &self.retry, |tx| {
            write(tx, SHUTDOWN_KEY, "1")?;
            Ok(())
        })
    }

    pub fn clear_shutdown(&mut self) -> Result<(), QueueError> {
        with_write_tx(&mut self.conn, &self.retry, |tx| {
            tx.execute("DELETE FROM meta WHERE key = ?1", params![SHUTDOWN_KEY])?;
            Ok(())
        })
    }

    pub fn shutdown_requested(&self) -> Result<bool, QueueError> {
        read_flag(&self.conn, SHUTDOWN_KEY)
    }

    /// Announce a feeder and start its heartbeat.
    pub fn register_feeder(
        &mut self,
        pid: u32,
        stale_after: chrono::Duration,
    ) -> Result<(), QueueError> {
        let now = to_millis(self.now());
        with_write_tx(&mut self.conn, &self.retry, |tx| {
            write(tx, FEEDER_PID_KEY, &pid.to_string())?;
            write(tx, FEEDER_HEARTBEAT_KEY, &now.to_string())?;
            write(
                tx,
                FEEDER_STALE_AFTER_KEY,
                &stale_after.num_milliseconds().to_string(),
            )?;
            Ok(())
        })
    }

    pub fn heartbeat(&mut self, pid: u32) -> Result<(), QueueError> {
        let now = to_millis(self.now());
        with_write_tx(&mut self.conn, &self.retry, |tx| {
            tx.execute(
                "UPDATE meta SET value = ?1 WHERE key = ?2 \
                 AND EXISTS (SELECT 1 FROM meta WHERE key = ?3 AND value = ?4)",
                params![
                    now.to_string(),
                    FEEDER_HEARTBEAT_KEY,
                    FEEDER_PID_KEY,
                    pid.to_string()
                ],
            )?;
            Ok(())
        })
    }

    /// Drop the registration, unless another feeder has taken over since.
    pub fn unregister_feeder(&mut self, pid: u32) -> Result<(), QueueError> {
        with_write_tx(&mut self.conn, &self.retry, |tx| {
            let current: Option<String> = tx
                .query_row(
                    "SELECT value FROM meta WHERE key = ?1",
                    params![FEEDER_PID_KEY],
                    |row| row.get(0),
                )
                .optional()?;
            if current.as_deref() == Some(pid.to_string().as_str()) {
                tx.execute(
                    "DELETE FROM meta WHERE key IN (?1, ?2, ?3)",
                    params![FEEDER_PID_KEY, FEEDER_HEARTBEAT_KEY, FEEDER_STALE_AFTER_KEY],
                )?;
            }
            Ok(())
        })
    }

    pub fn feeder(&self) -> Result<Option<FeederRegistration>, QueueError> {
        read_feeder(&self.conn)
    }
}

fn write(conn: &Connection, key: &str, value: &str) -> Result<(), QueueError> {
    conn.execute(
        "INSERT INTO meta(key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn read(conn: &Connection, key: &str) -> Result<Option<String>, QueueError> {
    Ok(conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

pub(crate) fn read_flag(conn: &Connection, key: &str) -> Result<bool, QueueError> {
    Ok(read(conn, key)?.is_some_and(|value| value == "1"))
}

fn read_i64(conn: &Connection, key: &str) -> Result<Option<i64>, QueueError> {
    Ok(read(conn, key)?.and_then(|value| value.parse().ok()))
}

pub(crate) fn read_feeder(conn: &Connection) -> Result<Option<FeederRegistration>, QueueError> {
    let pid = read_i64(conn, FEEDER_PID_KEY)?.and_then(|pid| u32::try_from(pid).ok());
    let heartbeat = read_i64(conn, FEEDER_HEARTBEAT_KEY)?;
    let stale_after = read_i64(conn, FEEDER_STALE_AFTER_KEY)?.unwrap_or(0);

    Ok(match (pid, heartbeat) {
        (Some(pid), Some(heartbeat)) => Some(FeederRegistration {
            pid,
            heartbeat: from_millis(heartbeat),
            stale_after: chrono::Duration::milliseconds(stale_after),
        }),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::clock::{Clock, ManualClock};

    #[test]
    fn shutdown_flag_is_visible_to_other_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q");
        let mut client = Queue::create(&path).unwrap();
        let daemon = Queue::open(&path).unwrap();

        assert!(!daemon.shutdown_requested().unwrap());
        client.request_shutdown().unwrap();
        assert!(daemon.shutdown_requested().unwrap());
        client.clear_shutdown().unwrap();
        assert!(!daemon.shutdown_requested().unwrap());
    }

    #[test]
    fn feeder_heartbeat_and_staleness() {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let dir = tempfile::tempdir().unwrap();
        let mut queue = Queue::create(dir.path().join("q"))
            .unwrap()
            .with_clock(Arc::new(clock.clone()));

        assert!(queue.feeder().unwrap().is_none());
        queue
            .register_feeder(321, chrono::Duration::seconds(30))
            .unwrap();
        clock.advance(chrono::Duration::seconds(20));
        queue.heartbeat(321).unwrap();

        let feeder = queue.feeder().unwrap().unwrap();
        assert_eq!(feeder.pid, 321);
        assert_eq!(feeder.heartbeat, start + chrono::Duration::seconds(20));
        assert!(!feeder.is_stale(clock.now()));
        assert!(feeder.is_stale(clock.now() + chrono::Duration::seconds(31)));
    }

    #[test]
    fn heartbeat_from_foreign_pid_is_ignored() {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let dir = tempfile::tempdir().unwrap();
        let mut queue = Queue::create(dir.path().join("q"))
            .unwrap()
            .with_clock(Arc::new(clock.clone()));

        queue
            .register_feeder(1, chrono::Duration::seconds(30))
            .unwrap();
        clock.advance(chrono::Duration::seconds(5));
        queue.heartbeat(2).unwrap();
        assert_eq!(queue.feeder().unwrap().unwrap().heartbeat, start);

        queue.unregister_feeder(2).unwrap();
        assert!(queue.feeder().unwrap().is_some());
        queue.unregister_feeder(1).unwrap();
        assert!(queue.feeder().unwrap().is_none());
    }
}
