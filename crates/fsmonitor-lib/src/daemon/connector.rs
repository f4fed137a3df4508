//! Client-side access to a running daemon: probing the endpoint, one-shot
//! request/response roundtrips, and the spawn-and-wait used by `start`.

use std::{process::Stdio, time::Duration};

use camino::Utf8Path;
use command_group::AsyncCommandGroup;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
    time::Instant,
};
use tracing::debug;

use super::{batches::TOKEN_HEADER, Paths};

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("daemon is not running")]
    NotRunning,
    #[error("unable to talk to daemon: {0}")]
    Io(#[from] std::io::Error),
    #[error("daemon answered: {0}")]
    Server(String),
    #[error("malformed daemon response")]
    MalformedResponse,
    #[error("unable to spawn daemon: {0}")]
    Spawn(std::io::Error),
    #[error("daemon exited before we could connect")]
    Exited,
    #[error("daemon did not start listening within {}s", .0.as_secs())]
    StartTimeout(Duration),
}

/// A parsed token query response.
#[derive(Debug, PartialEq, Eq)]
pub struct QueryResponse {
    /// The token to present on the next query.
    pub token: String,
    /// The client's token was stale; rescan everything.
    pub trivial: bool,
    pub paths: Vec<String>,
}

/// Connects to the daemon serving one working tree.
#[derive(Debug, Clone)]
pub struct DaemonConnector {
    pub paths: Paths,
}

impl DaemonConnector {
    /// How often `start`/`stop` re-probe the endpoint.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    /// Whether something is answering on the endpoint right now.
    pub async fn is_listening(&self) -> bool {
        UnixStream::connect(&self.paths.sock_file).await.is_ok()
    }

    pub async fn quit(&self) -> Result<(), ConnectorError> {
        self.request(b"quit").await.map(|_| ())
    }

    pub async fn flush(&self) -> Result<(), ConnectorError> {
        self.request(b"flush").await.map(|_| ())
    }

    pub async fn status(&self) -> Result<String, ConnectorError> {
        let response = self.request(b"status").await?;
        String::from_utf8(response).map_err(|_| ConnectorError::MalformedResponse)
    }

    /// Ask what changed since `token` (the full `builtin:...` wire form).
    pub async fn query(&self, token: &str) -> Result<QueryResponse, ConnectorError> {
        let response = self.request(token.as_bytes()).await?;
        let text = String::from_utf8(response).map_err(|_| ConnectorError::MalformedResponse)?;
        if let Some(message) = text.strip_prefix("error: ") {
            return Err(ConnectorError::Server(message.trim_end().to_owned()));
        }

        let mut lines = text.lines();
        let token = lines
            .next()
            .filter(|t| t.starts_with(TOKEN_HEADER))
            .ok_or(ConnectorError::MalformedResponse)?
            .to_owned();
        let paths: Vec<String> = lines.map(str::to_owned).collect();
        let trivial = paths.first().map(String::as_str) == Some("/");
        Ok(QueryResponse {
            token,
            trivial,
            paths: if trivial { Vec::new() } else { paths },
        })
    }

    /// Send `quit` and poll until the endpoint is released.
    pub async fn stop(&self) -> Result<(), ConnectorError> {
        debug!("stopping daemon");
        self.quit().await?;
        while self.is_listening().await {
            tokio::time::sleep(Self::POLL_INTERVAL).await;
        }
        Ok(())
    }

    /// Spawn a fully detached background daemon for `repo_root` and poll
    /// until it reaches the listening state or `start_timeout` elapses.
    pub async fn start(
        &self,
        repo_root: &Utf8Path,
        ipc_threads: usize,
        start_timeout: Duration,
    ) -> Result<(), ConnectorError> {
        let binary_path = std::env::current_exe().map_err(ConnectorError::Spawn)?;

        // A new process group with all stdio on the null device: the daemon
        // must survive the terminal this command ran in.
        let mut command = tokio::process::Command::new(binary_path);
        command
            .arg("run")
            .arg(format!("--ipc-threads={ipc_threads}"))
            .arg(format!("--log-file={}", self.paths.log_file))
            .current_dir(repo_root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut group = command
            .group()
            .kill_on_drop(false)
            .spawn()
            .map_err(ConnectorError::Spawn)?;
        let pid = group.inner().id().ok_or(ConnectorError::Exited)?;
        debug!("spawned background daemon with pid {pid}");

        let deadline = Instant::now() + start_timeout;
        loop {
            if self.is_listening().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ConnectorError::StartTimeout(start_timeout));
            }
            tokio::time::sleep(Self::POLL_INTERVAL).await;
        }
    }

    /// One roundtrip: connect, send the NUL-terminated request, read the
    /// response until the daemon closes the connection.
    async fn request(&self, command: &[u8]) -> Result<Vec<u8>, ConnectorError> {
        let mut stream = UnixStream::connect(&self.paths.sock_file)
            .await
            .map_err(|_| ConnectorError::NotRunning)?;
        stream.write_all(command).await?;
        stream.write_all(&[0]).await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok(response)
    }
}
