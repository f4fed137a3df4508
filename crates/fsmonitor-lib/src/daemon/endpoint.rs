//! Binding and releasing the daemon's IPC endpoint.
//!
//! The endpoint is a Unix-domain socket inside the repository metadata
//! directory. Liveness is probed through the socket itself: if something
//! answers a connect, a daemon is running; a socket file nobody answers on
//! is stale state from an unclean exit and is unlinked before binding.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

#[derive(Debug, Error)]
pub enum SocketOpenError {
    /// Returned when there is an IO error opening the socket, such as the
    /// path being too long for a socket address.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("another daemon is already listening on {0}")]
    AlreadyListening(Utf8PathBuf),
}

/// A bound endpoint. The socket file is unlinked again when this is
/// dropped, so `status` probes stop seeing a listener as soon as the
/// daemon's serve loop unwinds.
pub struct Endpoint {
    pub listener: UnixListener,
    sock_path: Utf8PathBuf,
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.sock_path);
    }
}

/// Bind the endpoint, refusing if a live daemon already answers on it.
pub async fn open_socket(sock_path: &Utf8Path) -> Result<Endpoint, SocketOpenError> {
    if sock_path.exists() {
        match UnixStream::connect(sock_path).await {
            Ok(_) => return Err(SocketOpenError::AlreadyListening(sock_path.to_owned())),
            Err(err) => {
                debug!("removing stale socket file {sock_path}: {err}");
                std::fs::remove_file(sock_path)?;
            }
        }
    }

    let listener = UnixListener::bind(sock_path)?;
    debug!("listening on socket at {sock_path}");
    Ok(Endpoint {
        listener,
        sock_path: sock_path.to_owned(),
    })
}
