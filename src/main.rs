use std::io::IsTerminal;
use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use serde::Serialize;

use rq::cli::{Cli, Command, FeedArgs};
use rq::config::FeedConfig;
use rq::control::{Control, read_commands};
use rq::feeder::Feeder;
use rq::queue::Queue;
use rq::ui::Reporter;
use rq::{QueueError, daemon, logging, shutdown};

#[derive(Serialize)]
struct Detached {
    feeder_pid: u32,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let reporter = Reporter::default();

    match run(cli, &reporter).await {
        Ok(code) => code,
        Err(err) => {
            reporter.error(&format!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, reporter: &Reporter) -> Result<ExitCode> {
    let Cli {
        queue,
        command,
        verbose,
    } = cli;

    // The feeder sets up its own subscriber, possibly writing to a file.
    if !matches!(command, Command::Feed(_)) {
        logging::init_client_logging(verbose)?;
    }
    let queue = queue.as_path();

    match command {
        Command::Create => {
            Control::create(queue)?;
            reporter.done(&format!("created queue {}", queue.display()));
        }
        Command::Submit { commands, tag } => {
            let commands = if commands == ["-"] {
                let stdin = std::io::stdin();
                if stdin.is_terminal() {
                    reporter.warn("reading commands from the terminal, end with ^D");
                }
                read_commands(stdin.lock())?
            } else {
                commands
            };
            let receipts = Control::open(queue)?.submit_many(commands, tag)?;
            reporter.document(&receipts)?;
        }
        Command::Status => {
            reporter.document(&Control::open(queue)?.status()?)?;
        }
        Command::Query { filter } => {
            reporter.document(&Control::open(queue)?.query(&filter)?)?;
        }
        Command::List { all } => {
            reporter.document(&Control::open(queue)?.list(all)?)?;
        }
        Command::Delete { ids } => {
            let mut control = Control::open(queue)?;
            let mut deleted = Vec::new();
            let mut refused = false;
            for id in ids {
                match control.delete(id) {
                    Ok(job) => deleted.push(job),
                    Err(err @ (QueueError::InvalidTransition { .. } | QueueError::NotFound(_))) => {
                        reporter.error(&err.to_string());
                        refused = true;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            reporter.document(&deleted)?;
            if refused {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Shutdown => {
            reporter.document(&Control::open(queue)?.shutdown()?)?;
        }
        Command::Feed(args) => return feed(queue, &args, verbose, reporter).await,
    }

    Ok(ExitCode::SUCCESS)
}

async fn feed(
    queue_path: &Path,
    args: &FeedArgs,
    verbose: bool,
    reporter: &Reporter,
) -> Result<ExitCode> {
    let config = FeedConfig::load(queue_path)?.apply(args.overrides());
    config.validate()?;
    let queue = Queue::open(queue_path)?;

    if config.daemon {
        drop(queue);
        let feeder_pid = daemon::detach(queue_path, &config)?;
        reporter.document(&Detached { feeder_pid })?;
        return Ok(ExitCode::SUCCESS);
    }

    let _guard = logging::init_feed_logging(config.log.as_deref(), verbose)?;
    let stop = shutdown::install_signal_handler();
    let stats = Feeder::new(queue, &config, stop).run().await?;
    tracing::debug!(cycles = stats.cycles, "feeder exiting");
    Ok(ExitCode::SUCCESS)
}
