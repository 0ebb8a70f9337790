use std::fs::File;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};

use crate::state_machine::{Job, JobId};

/// Exit code recorded when a job's process could not be started at all.
pub const LAUNCH_FAILED_EXIT_CODE: i32 = 127;

/// Exit code recorded when the OS lost track of a child we launched.
pub const LOST_EXIT_CODE: i32 = 255;

/// Starts job commands through a shell, with output captured to files.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    shell: PathBuf,
}

impl Default for JobExecutor {
    fn default() -> Self {
        Self::with_shell("/bin/sh")
    }
}

/// Where a launched job writes its output.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// A job whose process is in flight. Polled, never awaited.
#[derive(Debug)]
pub struct RunningJob {
    pub id: JobId,
    pub pid: Option<u32>,
    child: Child,
}

impl JobExecutor {
    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Spawn `sh -c <command>` without waiting for it.
    pub fn launch(&self, job: &Job, output: &OutputPaths) -> std::io::Result<RunningJob> {
        tracing::info!(job_id = job.id, command = %job.command, "launching job");

        let stdout = File::create(&output.stdout)?;
        let stderr = File::create(&output.stderr)?;

        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(&job.command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .env("RQ_JOB_ID", job.id.to_string())
            .kill_on_drop(false)
            .spawn()?;

        Ok(RunningJob {
            id: job.id,
            pid: child.id(),
            child,
        })
    }
}

impl RunningJob {
    /// Non-blocking check; `Some(exit_code)` once the process is gone.
    pub fn try_reap(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(exit_code(status)),
            Ok(None) => None,
            Err(err) => {
                tracing::error!(job_id = self.id, error = %err, "lost track of job process");
                Some(LOST_EXIT_CODE)
            }
        }
    }
}

/// Map an exit status to a single code; a signal death is 128 + signal,
/// as a shell would report it.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => LOST_EXIT_CODE,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;

    fn job(id: JobId, command: &str) -> Job {
        Job::new(id, command.into(), None, Utc::now())
    }

    fn outputs(dir: &std::path::Path, id: JobId) -> OutputPaths {
        OutputPaths {
            stdout: dir.join(format!("{id}.out")),
            stderr: dir.join(format!("{id}.err")),
        }
    }

    async fn wait_for(running: &mut RunningJob) -> i32 {
        for _ in 0..200 {
            if let Some(code) = running.try_reap() {
                return code;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("job {} never finished", running.id);
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let paths = outputs(dir.path(), 1);
        let mut running = JobExecutor::default()
            .launch(&job(1, "echo out; echo err >&2; exit 3"), &paths)
            .unwrap();
        assert!(running.pid.is_some());

        assert_eq!(wait_for(&mut running).await, 3);
        assert_eq!(std::fs::read_to_string(&paths.stdout).unwrap(), "out\n");
        assert_eq!(std::fs::read_to_string(&paths.stderr).unwrap(), "err\n");
    }

    #[tokio::test]
    async fn job_sees_its_own_id() {
        let dir = tempfile::tempdir().unwrap();
        let paths = outputs(dir.path(), 17);
        let mut running = JobExecutor::default()
            .launch(&job(17, "echo $RQ_JOB_ID"), &paths)
            .unwrap();
        assert_eq!(wait_for(&mut running).await, 0);
        assert_eq!(std::fs::read_to_string(&paths.stdout).unwrap(), "17\n");
    }

    #[tokio::test]
    async fn try_reap_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut running = JobExecutor::default()
            .launch(&job(2, "sleep 5"), &outputs(dir.path(), 2))
            .unwrap();
        assert_eq!(running.try_reap(), None);
        running.child.start_kill().unwrap();
        assert_eq!(wait_for(&mut running).await, 128 + 9);
    }

    #[tokio::test]
    async fn missing_shell_fails_to_launch() {
        let dir = tempfile::tempdir().unwrap();
        let result = JobExecutor::with_shell("/nonexistent/sh")
            .launch(&job(3, "true"), &outputs(dir.path(), 3));
        assert!(result.is_err());
    }
}
