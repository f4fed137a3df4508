#![deny(clippy::all)]

//! Kernel file-system notification plumbing for the fsmonitor daemon.
//!
//! [`FileSystemWatcher`] wraps a [`notify`] backend watching the working
//! tree (and the external metadata directory, when there is one) and
//! re-broadcasts raw events to any number of subscribers. Before a watcher
//! is handed out it performs one cookie roundtrip, so subscribers only ever
//! observe events that are *new* rather than replayed pre-existing state.

use std::{sync::Arc, time::Duration};

use camino::Utf8Path;
use notify::{Config, Event, EventHandler, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

pub mod classify;
pub mod cookies;

pub use classify::{PathKind, WatchRoots, COOKIE_PREFIX, DOT_GIT};

type Backend = RecommendedWatcher;

type EventResult = Result<Event, notify::Error>;

/// How long we give the backend to deliver the startup cookie before
/// declaring it broken.
const STARTUP_COOKIE_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("filewatching backend error: {0}")]
    Notify(#[from] notify::Error),
    #[error("filewatching failed to start: {0}")]
    Setup(String),
}

// We want to broadcast the errors we get, but notify::Error does not
// implement Clone. Wrap it in an Arc so it can travel over a broadcast
// channel.
#[derive(Clone, Debug, Error)]
#[error("{0}")]
pub struct NotifyError(Arc<notify::Error>);

impl From<notify::Error> for NotifyError {
    fn from(value: notify::Error) -> Self {
        Self(Arc::new(value))
    }
}

/// A running notification backend with fan-out.
///
/// Dropping the watcher closes the broadcast channel (subscribers see
/// `RecvError::Closed`) and releases the kernel watch handles.
pub struct FileSystemWatcher {
    sender: broadcast::Sender<Result<Event, NotifyError>>,
    // _exit_ch exists to stop the forwarding task when this struct is
    // dropped. The task owns the backend, so the kernel resources go away
    // with it, and dropping its broadcast sender closes all subscribers.
    _exit_ch: oneshot::Sender<()>,
}

impl FileSystemWatcher {
    /// Initialise the backend over `roots` and wait for the startup cookie
    /// roundtrip through `cookie_dir`. On return the event stream is live
    /// and delivering only new events.
    pub async fn new(roots: &WatchRoots, cookie_dir: &Utf8Path) -> Result<Self, WatchError> {
        debug!("initing file-system watcher");

        let (send_file_events, mut recv_file_events) = mpsc::channel(1024);
        let watch_paths = roots.watch_paths();
        let watcher = tokio::task::spawn_blocking(move || run_watcher(&watch_paths, send_file_events))
            .await
            .map_err(|e| WatchError::Setup(format!("watcher setup task died: {e}")))??;

        // Ensure we are ready to receive new events, not events for existing
        // state.
        debug!("waiting for startup filesystem cookie");
        wait_for_cookie(cookie_dir, &mut recv_file_events).await?;
        debug!("filewatching ready");

        let (sender, _first_receiver) = broadcast::channel(1024);
        let (exit_ch, exit_signal) = oneshot::channel();
        tokio::spawn(watch_events(
            watcher,
            recv_file_events,
            exit_signal,
            sender.clone(),
        ));

        Ok(Self {
            sender,
            _exit_ch: exit_ch,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Result<Event, NotifyError>> {
        self.sender.subscribe()
    }
}

async fn watch_events(
    _watcher: Backend,
    mut recv_file_events: mpsc::Receiver<EventResult>,
    mut exit_signal: oneshot::Receiver<()>,
    broadcast_sender: broadcast::Sender<Result<Event, NotifyError>>,
) {
    loop {
        tokio::select! {
            _ = &mut exit_signal => break,
            event = recv_file_events.recv() => match event {
                // A send failure just means no one is currently subscribed.
                Some(event) => {
                    let _ = broadcast_sender.send(event.map_err(NotifyError::from));
                }
                None => break,
            }
        }
    }
}

fn run_watcher(
    paths: &[camino::Utf8PathBuf],
    sender: mpsc::Sender<EventResult>,
) -> Result<Backend, WatchError> {
    let mut watcher = make_watcher(move |res| {
        let _ = sender.blocking_send(res);
    })?;

    for path in paths {
        watcher.watch(path.as_std_path(), RecursiveMode::Recursive)?;
    }
    Ok(watcher)
}

fn make_watcher<F: EventHandler>(event_handler: F) -> Result<Backend, notify::Error> {
    RecommendedWatcher::new(event_handler, Config::default())
}

/// Performs a roundtrip through the filewatching mechanism: write a cookie
/// file, wait until its event comes back, delete it. Some backends replay
/// events for existing state; everything after the cookie is new.
async fn wait_for_cookie(
    cookie_dir: &Utf8Path,
    recv: &mut mpsc::Receiver<EventResult>,
) -> Result<(), WatchError> {
    let cookie_path = cookie_dir.join(format!("{COOKIE_PREFIX}startup"));
    std::fs::write(&cookie_path, b"").map_err(|e| {
        WatchError::Setup(format!("failed to write cookie to {cookie_path}: {e}"))
    })?;
    loop {
        let event = tokio::time::timeout(STARTUP_COOKIE_TIMEOUT, recv.recv())
            .await
            .map_err(|e| WatchError::Setup(format!("waiting for cookie timed out: {e}")))?
            .ok_or_else(|| {
                WatchError::Setup("filewatching closed before cookie file was observed".to_string())
            })?
            .map_err(|e| WatchError::Setup(format!("initial watch encountered errors: {e}")))?;
        if event
            .paths
            .iter()
            .any(|path| path.as_path() == cookie_path.as_std_path())
        {
            if let Err(e) = std::fs::remove_file(&cookie_path) {
                // Not fatal: the file matches the cookie prefix and will
                // never be reported to clients.
                warn!("failed to remove cookie file {cookie_path}: {e}");
            }
            return Ok(());
        }
    }
}
