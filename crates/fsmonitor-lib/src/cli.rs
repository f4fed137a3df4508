//! The `fsmonitor--daemon` command-line surface.

use camino::Utf8PathBuf;
use clap::{ArgAction, Parser, Subcommand};
use thiserror::Error;

use crate::{commands, config, daemon, git};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Git(#[from] git::GitError),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Daemon(#[from] daemon::DaemonError),
    #[error(transparent)]
    Connector(#[from] daemon::ConnectorError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Parser)]
#[command(
    name = "fsmonitor--daemon",
    version,
    about = "Watches a git working tree and answers \"what changed since token T\" over local IPC"
)]
pub struct Args {
    /// Maximum number of IPC clients served concurrently
    #[arg(long, global = true, value_name = "N")]
    pub ipc_threads: Option<usize>,
    /// Seconds `start` waits for the background daemon to begin listening
    #[arg(long, global = true, value_name = "SECONDS")]
    pub start_timeout: Option<u64>,
    /// Write daemon logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<Utf8PathBuf>,
    /// Increase log verbosity (-v, -vv)
    #[arg(short = 'v', global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    #[command(subcommand)]
    pub command: DaemonCommand,
}

#[derive(Debug, Subcommand, Clone, Copy, PartialEq, Eq)]
pub enum DaemonCommand {
    /// Spawn a daemon in the background and wait for it to start listening
    Start,
    /// Run the daemon in the foreground
    Run,
    /// Ask the daemon watching this working tree to quit
    Stop,
    /// Report whether a daemon is watching this working tree
    Status,
}

/// Parse, dispatch, and map the outcome to a process exit code.
pub fn main() -> i32 {
    let args = Args::parse();
    match run(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("fsmonitor--daemon: {err}");
            1
        }
    }
}

fn run(args: Args) -> Result<i32, Error> {
    let _subscriber = crate::tracing::init(args.verbosity, args.log_file.as_deref());
    let base = commands::CommandBase::new(&args)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(commands::daemon::main(args.command, &base))
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::{Args, DaemonCommand};

    #[test]
    fn parses_subcommands_and_flags() {
        let args = Args::parse_from(["fsmonitor--daemon", "start", "--ipc-threads", "4"]);
        assert_eq!(args.command, DaemonCommand::Start);
        assert_eq!(args.ipc_threads, Some(4));
        assert_eq!(args.start_timeout, None);

        let args = Args::parse_from([
            "fsmonitor--daemon",
            "run",
            "--start-timeout=10",
            "--log-file=/tmp/d.log",
            "-vv",
        ]);
        assert_eq!(args.command, DaemonCommand::Run);
        assert_eq!(args.start_timeout, Some(10));
        assert_eq!(args.log_file.as_deref().map(|p| p.as_str()), Some("/tmp/d.log"));
        assert_eq!(args.verbosity, 2);
    }

    #[test]
    fn requires_a_subcommand() {
        assert!(Args::try_parse_from(["fsmonitor--daemon"]).is_err());
        assert!(Args::try_parse_from(["fsmonitor--daemon", "bogus"]).is_err());
    }
}
