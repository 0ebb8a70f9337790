use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::queue::Queue;
use crate::status::StatusReport;

/// Ask every feeder attached to `queue` to stop claiming work.
///
/// Nothing is killed: RUNNING jobs stay RUNNING until they exit on their own.
/// Returns the queue state right after the flag was written.
pub fn request(queue: &mut Queue) -> Result<StatusReport, QueueError> {
    queue.request_shutdown()?;
    tracing::info!(queue = %queue.root().display(), "shutdown requested");
    StatusReport::collect(queue)
}

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. The feeder treats it like a shutdown request for its own process.
pub fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(err), _) | (_, Err(err)) => {
                    tracing::error!(error = %err, "failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, draining in-flight jobs");
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT, draining in-flight jobs");
            }
        }

        token_clone.cancel();
    });

    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{JobState, NewJob};

    #[test]
    fn shutdown_leaves_running_jobs_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = Queue::create(dir.path().join("q")).unwrap();
        queue.insert(NewJob::new("sleep 15")).unwrap();
        queue.insert(NewJob::new("sleep 15")).unwrap();
        queue.claim_next_pending().unwrap();

        let report = request(&mut queue).unwrap();
        assert!(report.shutdown_requested);
        assert_eq!(report.jobs.running, 1);
        assert_eq!(report.jobs.pending, 1);
        assert_eq!(queue.get(1).unwrap().state, JobState::Running);
    }
}
