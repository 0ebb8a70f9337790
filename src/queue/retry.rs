use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::error::QueueError;

/// How long a writer keeps trying when another process holds the queue lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetry {
    /// Attempts before giving up with [`QueueError::LockTimeout`].
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff step.
    pub max_delay_ms: u64,
    /// SQLite's own busy wait per attempt.
    pub busy_timeout_ms: u64,
}

impl Default for LockRetry {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay_ms: 25,
            max_delay_ms: 1_000,
            busy_timeout_ms: 2_000,
        }
    }
}

impl LockRetry {
    /// delay = base_delay_ms * 2^(attempt - 1), capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Run `op` inside a `BEGIN IMMEDIATE` transaction, retrying on lock contention.
///
/// The immediate transaction takes SQLite's reserved lock up front, which makes
/// it the single-writer section for every process sharing the queue. The OS
/// drops the lock when a holder dies, so a crashed feeder cannot wedge the queue.
pub(crate) fn with_write_tx<T, F>(
    conn: &mut Connection,
    retry: &LockRetry,
    mut op: F,
) -> Result<T, QueueError>
where
    F: FnMut(&Transaction<'_>) -> Result<T, QueueError>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(QueueError::from)
            .and_then(|tx| {
                let value = op(&tx)?;
                tx.commit()?;
                Ok(value)
            });

        match result {
            Err(err) if err.is_contention() => {
                if attempt >= retry.max_attempts {
                    return Err(QueueError::LockTimeout { attempts: attempt });
                }
                let delay = retry.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "queue busy, backing off"
                );
                std::thread::sleep(delay);
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_is_capped() {
        let retry = LockRetry {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 500,
            busy_timeout_ms: 0,
        };
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(retry.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn gives_up_with_lock_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let mut holder = Connection::open(&path).unwrap();
        holder.execute_batch("CREATE TABLE t(x INTEGER);").unwrap();
        let _held = holder
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .unwrap();

        let mut contender = Connection::open(&path).unwrap();
        contender.busy_timeout(Duration::from_millis(1)).unwrap();
        let retry = LockRetry {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            busy_timeout_ms: 1,
        };

        let mut calls = 0;
        let err = with_write_tx(&mut contender, &retry, |tx| {
            calls += 1;
            tx.execute("INSERT INTO t(x) VALUES (1)", [])?;
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, QueueError::LockTimeout { attempts: 3 }));
        assert_eq!(calls, 0);
    }

    #[test]
    fn logic_errors_are_not_retried() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut calls = 0;
        let err = with_write_tx(&mut conn, &LockRetry::default(), |_tx| -> Result<(), _> {
            calls += 1;
            Err(QueueError::NotFound("job 1".into()))
        })
        .unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
        assert_eq!(calls, 1);
    }
}
