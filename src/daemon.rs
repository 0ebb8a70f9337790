use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::config::FeedConfig;

/// Re-run this binary as `rq <queue> feed --attached ...` in its own process
/// group, with no terminal attached, and return the child's pid.
pub fn detach(queue: &Path, config: &FeedConfig) -> std::io::Result<u32> {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("rq"));
    let child = Command::new(exe)
        .args(feed_args(&absolute(queue)?, config)?)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()?;

    tracing::debug!(pid = child.id(), "feeder detached");
    Ok(child.id())
}

fn feed_args(queue: &Path, config: &FeedConfig) -> std::io::Result<Vec<String>> {
    let mut args = vec![
        queue.display().to_string(),
        "feed".to_string(),
        "--attached".to_string(),
        format!("--max-feed={}", config.max_feed),
        format!("--min-sleep={}", config.min_sleep),
        format!("--max-sleep={}", config.max_sleep),
    ];
    if let Some(log) = &config.log {
        args.push(format!("--log={}", absolute(log)?.display()));
    }
    Ok(args)
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
