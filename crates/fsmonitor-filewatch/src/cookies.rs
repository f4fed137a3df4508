//! Cookies are the daemon's way of synchronizing with the file system event
//! stream. A cookie is a short-lived file named `.fsmonitor-daemon-<serial>`
//! that the daemon drops into the repository metadata directory. Once the
//! creation event for that file comes back over the event stream, every
//! event that preceded the cookie's creation has been delivered, so a query
//! answered after the roundtrip cannot miss earlier changes.
//!
//! The split mirrors the two sides of the stream:
//! - [`CookieRegistry`] is consulted by the event listener. It tracks the
//!   cookie filenames with an outstanding waiter; `observe` reports whether
//!   an event was one of ours.
//! - [`CookieWriter`] is used by request handlers. `barrier` writes the next
//!   serial-numbered cookie file, registers it, and waits (bounded) for the
//!   listener to observe it.

use std::{
    collections::HashMap,
    fs,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::{sync::oneshot, time::error::Elapsed};
use tracing::{trace, warn};

use crate::classify::COOKIE_PREFIX;

#[derive(Debug, Error)]
pub enum CookieError {
    #[error("cookie timeout expired")]
    Timeout(#[from] Elapsed),
    #[error("cookie watcher went away before the cookie was observed")]
    WatcherGone(#[from] oneshot::error::RecvError),
    #[error("failed to write cookie file at {path}: {io_err}")]
    Io {
        io_err: std::io::Error,
        path: Utf8PathBuf,
    },
}

/// Outcome of matching an observed filename against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieHit {
    /// The filename was a registered cookie; its waiter has been released.
    Hit,
    /// Not a cookie we are waiting on.
    Miss,
}

/// Tracks the cookie filenames the daemon has created and not yet seen come
/// back over the event stream.
#[derive(Debug, Default)]
pub struct CookieRegistry {
    pending: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl CookieRegistry {
    /// Register an outstanding cookie filename. The returned receiver
    /// resolves when the listener observes the file.
    pub fn register(&self, name: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(name.to_owned(), tx);
        rx
    }

    /// Called by the listener for every cookie-prefixed filename it sees.
    pub fn observe(&self, name: &str) -> CookieHit {
        match self.pending.lock().unwrap().remove(name) {
            Some(waiter) => {
                trace!("observed cookie {name}");
                // The waiter may have timed out and gone away.
                let _ = waiter.send(());
                CookieHit::Hit
            }
            None => CookieHit::Miss,
        }
    }

    pub fn unregister(&self, name: &str) {
        self.pending.lock().unwrap().remove(name);
    }
}

/// Writes serial-numbered cookie files and waits for their roundtrip
/// through the event stream.
pub struct CookieWriter {
    cookie_dir: Utf8PathBuf,
    timeout: Duration,
    serial: AtomicU64,
    registry: Arc<CookieRegistry>,
}

impl CookieWriter {
    pub fn new(cookie_dir: &Utf8Path, timeout: Duration, registry: Arc<CookieRegistry>) -> Self {
        Self {
            cookie_dir: cookie_dir.to_owned(),
            timeout,
            serial: AtomicU64::new(0),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<CookieRegistry> {
        &self.registry
    }

    /// Perform one cookie roundtrip. When this returns `Ok`, every kernel
    /// event issued before the call has been delivered to the listener.
    pub async fn barrier(&self) -> Result<(), CookieError> {
        let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("{COOKIE_PREFIX}{serial}");
        let path = self.cookie_dir.join(&name);

        let seen = self.registry.register(&name);
        trace!("writing cookie {path}");
        if let Err(io_err) = fs::write(&path, b"") {
            self.registry.unregister(&name);
            return Err(CookieError::Io { io_err, path });
        }

        let result = tokio::time::timeout(self.timeout, seen).await;
        self.registry.unregister(&name);
        if let Err(err) = fs::remove_file(&path) {
            // A leftover cookie is harmless; it matches the cookie prefix
            // and is cleaned up with the metadata directory.
            warn!("failed to remove cookie file {path}: {err}");
        }
        result??;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use camino::Utf8PathBuf;

    use super::{CookieError, CookieHit, CookieRegistry, CookieWriter};

    #[test]
    fn registry_hit_and_miss() {
        let registry = CookieRegistry::default();
        let mut rx = registry.register(".fsmonitor-daemon-1");

        assert_eq!(registry.observe(".fsmonitor-daemon-2"), CookieHit::Miss);
        assert_eq!(registry.observe(".fsmonitor-daemon-1"), CookieHit::Hit);
        // Second observation of the same name no longer matches.
        assert_eq!(registry.observe(".fsmonitor-daemon-1"), CookieHit::Miss);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn unregister_drops_waiter() {
        let registry = CookieRegistry::default();
        let mut rx = registry.register(".fsmonitor-daemon-1");
        registry.unregister(".fsmonitor-daemon-1");
        assert_eq!(registry.observe(".fsmonitor-daemon-1"), CookieHit::Miss);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn barrier_completes_on_observation() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(tmp.path().to_owned()).unwrap();
        let registry = Arc::new(CookieRegistry::default());
        let writer = Arc::new(CookieWriter::new(
            &dir,
            Duration::from_secs(5),
            registry.clone(),
        ));

        let barrier = tokio::spawn({
            let writer = writer.clone();
            async move { writer.barrier().await }
        });

        // Stand in for the listener: poll the directory until the cookie
        // file shows up, then report it observed.
        let name = loop {
            let entry = std::fs::read_dir(&dir).unwrap().next();
            if let Some(entry) = entry {
                break entry.unwrap().file_name().into_string().unwrap();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(registry.observe(&name), CookieHit::Hit);

        barrier.await.unwrap().unwrap();
        // The cookie file is cleaned up after the roundtrip.
        assert!(std::fs::read_dir(&dir).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn barrier_times_out_without_observer() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(tmp.path().to_owned()).unwrap();
        let writer = CookieWriter::new(
            &dir,
            Duration::from_millis(10),
            Arc::new(CookieRegistry::default()),
        );

        match writer.barrier().await {
            Err(CookieError::Timeout(_)) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn serials_are_unique() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(tmp.path().to_owned()).unwrap();
        let registry = Arc::new(CookieRegistry::default());
        let writer = CookieWriter::new(&dir, Duration::from_millis(10), registry);

        // Nobody observes, so both barriers time out, but each must have
        // used a distinct cookie name.
        assert!(writer.barrier().await.is_err());
        assert!(writer.barrier().await.is_err());
        assert_eq!(writer.serial.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
