//! The fsmonitor daemon: event log, IPC server, and the client-side
//! connector the subcommands drive it with.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

pub mod batches;
pub mod connector;
mod endpoint;
mod server;

pub use connector::{ConnectorError, DaemonConnector, QueryResponse};
pub use server::{CloseReason, FsMonitorServer};

/// Socket filename inside the metadata directory.
const SOCK_NAME: &str = "fsmonitor--daemon.ipc";
/// Where a background daemon writes its log.
const LOG_NAME: &str = "fsmonitor--daemon.log";

/// The filesystem locations one daemon instance owns. Both live inside the
/// metadata directory: its permissions gate access to the endpoint, and
/// neither is ever reported as a change.
#[derive(Debug, Clone)]
pub struct Paths {
    pub sock_file: Utf8PathBuf,
    pub log_file: Utf8PathBuf,
}

impl Paths {
    pub fn from_gitdir(gitdir: &Utf8Path) -> Self {
        Self {
            sock_file: gitdir.join(SOCK_NAME),
            log_file: gitdir.join(LOG_NAME),
        }
    }
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("filewatching failed: {0}")]
    Watch(#[from] fsmonitor_filewatch::WatchError),
    #[error(transparent)]
    SocketOpen(#[from] endpoint::SocketOpenError),
    #[error("a daemon is already watching this working tree")]
    AlreadyRunning,
    #[error("IPC protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
