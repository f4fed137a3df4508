//! The `start` / `run` / `stop` / `status` subcommands.

use tracing::info;

use super::CommandBase;
use crate::{
    cli::{DaemonCommand, Error},
    daemon::{DaemonConnector, DaemonError, FsMonitorServer},
};

/// Runs one daemon subcommand, returning the process exit code.
pub async fn main(command: DaemonCommand, base: &CommandBase) -> Result<i32, Error> {
    let connector = DaemonConnector::new(base.paths.clone());

    match command {
        DaemonCommand::Status => {
            if connector.is_listening().await {
                println!("fsmonitor--daemon is watching '{}'", base.repo.worktree);
                Ok(0)
            } else {
                println!("fsmonitor--daemon is not watching '{}'", base.repo.worktree);
                Ok(1)
            }
        }
        DaemonCommand::Stop => {
            connector.stop().await?;
            Ok(0)
        }
        DaemonCommand::Run => {
            if connector.is_listening().await {
                return Err(DaemonError::AlreadyRunning.into());
            }
            run_server(base).await
        }
        DaemonCommand::Start => {
            if connector.is_listening().await {
                return Err(DaemonError::AlreadyRunning.into());
            }
            connector
                .start(
                    &base.repo.worktree,
                    base.config.ipc_threads,
                    base.config.start_timeout,
                )
                .await?;
            println!("fsmonitor--daemon started for '{}'", base.repo.worktree);
            Ok(0)
        }
    }
}

async fn run_server(base: &CommandBase) -> Result<i32, Error> {
    let server = FsMonitorServer::new(base.watch_roots(), &base.config);
    let reason = server.serve(base.paths.clone()).await?;
    info!("daemon closed: {reason:?}");
    Ok(0)
}
