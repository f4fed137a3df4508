//! The daemon itself: the event listener, the IPC server, and the
//! controller that wires them together and sequences shutdown.
//!
//! One listener task consumes the kernel event stream, classifies every
//! path, and appends reportable changes to the [`BatchLog`]. The accept
//! loop hands each connection to a worker task; worker concurrency is
//! bounded by a semaphore sized from `fsmonitor.ipcthreads`. All of it
//! unwinds cooperatively: `quit` (or ctrl-c) breaks the serve loop, the
//! watcher is dropped so the listener drains and exits, in-flight workers
//! are joined, and the endpoint is released last.

use std::{sync::Arc, time::Duration};

use fsmonitor_filewatch::{
    cookies::{CookieRegistry, CookieWriter},
    FileSystemWatcher, NotifyError, PathKind, WatchRoots,
};
use notify::{Event, EventKind};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::UnixStream,
    select, signal,
    sync::{broadcast, oneshot, Mutex, Semaphore},
    task::JoinSet,
};
use tracing::{debug, info, trace, warn};

use super::{
    batches::{BatchLog, Token, TOKEN_HEADER},
    endpoint, DaemonError, Paths,
};
use crate::config::DaemonConfig;

/// Requests are tiny (a token or a keyword); anything bigger is abuse.
const MAX_REQUEST_LEN: u64 = 64 * 1024;

/// How long a query waits for its cookie to come back over the event
/// stream before serving from what it has.
const QUERY_COOKIE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Why the serve loop ended.
#[derive(Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// A client sent `quit`.
    Shutdown,
    /// The notification backend closed its stream.
    WatcherClosed,
    Interrupt,
}

pub struct FsMonitorServer {
    inner: Arc<ServerInner>,
    ipc_threads: usize,
    shutdown_rx: oneshot::Receiver<()>,
}

struct ServerInner {
    roots: WatchRoots,
    log: BatchLog,
    cookies: CookieWriter,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    error_slot: std::sync::Mutex<Option<DaemonError>>,
}

impl FsMonitorServer {
    pub fn new(roots: WatchRoots, config: &DaemonConfig) -> Self {
        let registry = Arc::new(CookieRegistry::default());
        let cookies = CookieWriter::new(roots.metadata_dir(), QUERY_COOKIE_TIMEOUT, registry);
        let (send_shutdown, recv_shutdown) = oneshot::channel();

        Self {
            inner: Arc::new(ServerInner {
                roots,
                log: BatchLog::new(config.test_tokens),
                cookies,
                shutdown: Mutex::new(Some(send_shutdown)),
                error_slot: std::sync::Mutex::new(None),
            }),
            ipc_threads: config.ipc_threads,
            shutdown_rx: recv_shutdown,
        }
    }

    /// Run the daemon until something asks it to stop.
    ///
    /// Boot ordering matters: the notification backend is brought up first
    /// (a failure there aborts before anything else exists), the endpoint
    /// is bound before the listener task starts appending, and the error
    /// slot is rolled up only after every task has been joined.
    pub async fn serve(mut self, paths: Paths) -> Result<CloseReason, DaemonError> {
        let watcher =
            FileSystemWatcher::new(&self.inner.roots, self.inner.roots.metadata_dir()).await?;
        // Subscribing before the endpoint is bound: the subscription buffers
        // events until the listener task starts draining it.
        let events = watcher.subscribe();
        let endpoint = endpoint::open_socket(&paths.sock_file).await?;
        info!(
            "watching {} ({} roots), listening on {}",
            self.inner.roots.worktree(),
            self.inner.roots.watch_paths().len(),
            paths.sock_file
        );

        let mut listener_task = tokio::spawn(run_listener(self.inner.clone(), events));
        let permits = Arc::new(Semaphore::new(self.ipc_threads));
        let mut clients = JoinSet::new();

        let close_reason = loop {
            select! {
                _ = &mut self.shutdown_rx => break CloseReason::Shutdown,
                _ = signal::ctrl_c() => break CloseReason::Interrupt,
                _ = &mut listener_task => {
                    warn!("event listener stopped unexpectedly");
                    break CloseReason::WatcherClosed;
                }
                Some(_) = clients.join_next(), if !clients.is_empty() => {}
                accepted = endpoint.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        clients.spawn(handle_connection(
                            self.inner.clone(),
                            stream,
                            permits.clone(),
                        ));
                    }
                    Err(err) => warn!("failed to accept connection: {err}"),
                },
            }
        };
        debug!("serve loop closed: {close_reason:?}");

        // Dropping the watcher closes the event stream; the listener drains
        // whatever is already queued and exits.
        drop(watcher);
        if !listener_task.is_finished() {
            let _ = (&mut listener_task).await;
        }
        while clients.join_next().await.is_some() {}
        drop(endpoint);

        if let Some(err) = self.inner.error_slot.lock().unwrap().take() {
            return Err(err);
        }
        Ok(close_reason)
    }
}

impl ServerInner {
    async fn signal_shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
    }

    fn record_error(&self, err: DaemonError) {
        let mut slot = self.error_slot.lock().unwrap();
        // The first error recorded decides the exit code.
        slot.get_or_insert(err);
    }
}

/// The event listener: classify every path the kernel reports and feed the
/// batch log. Exits when the broadcast stream closes.
async fn run_listener(
    inner: Arc<ServerInner>,
    mut events: broadcast::Receiver<Result<Event, NotifyError>>,
) {
    loop {
        match events.recv().await {
            Ok(Ok(event)) => handle_event(&inner, event),
            Ok(Err(err)) => {
                warn!("event backend error, resyncing: {err}");
                inner.log.resync();
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("event stream dropped {missed} events, resyncing");
                inner.log.resync();
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("event listener drained");
}

fn handle_event(inner: &ServerInner, event: Event) {
    if event.need_rescan() {
        warn!("event backend overflowed, resyncing");
        inner.log.resync();
        return;
    }
    if matches!(event.kind, EventKind::Access(_)) {
        return;
    }

    for path in &event.paths {
        let Some(path) = camino::Utf8Path::from_path(path) else {
            warn!("ignoring non-UTF-8 path {path:?}");
            continue;
        };
        match inner.roots.classify(path) {
            PathKind::OutsideCone => {}
            // Metadata churn is private; clients must never see it.
            PathKind::InsideDotGit | PathKind::InsideGitdir => {}
            PathKind::InsideDotGitWithCookiePrefix | PathKind::InsideGitdirWithCookiePrefix => {
                if let Some(name) = path.file_name() {
                    let hit = inner.cookies.registry().observe(name);
                    trace!("cookie {name}: {hit:?}");
                }
            }
            PathKind::DotGit | PathKind::Gitdir => {
                // The metadata root itself moved or was replaced. Nothing
                // we have buffered can be trusted.
                warn!("metadata root changed ({path}), resyncing");
                inner.log.resync();
            }
            PathKind::WorkdirPath => {
                if let Some(rel) = inner.roots.worktree_relative(path) {
                    trace!("change: {rel}");
                    inner.log.append(rel.to_owned());
                }
            }
        }
    }
}

/// One worker: waits for a permit, then speaks the protocol once.
/// Transient client I/O problems are logged and dropped; they must not
/// disturb the daemon or other clients.
async fn handle_connection(inner: Arc<ServerInner>, mut stream: UnixStream, permits: Arc<Semaphore>) {
    let Ok(_permit) = permits.acquire_owned().await else {
        return;
    };
    if let Err(err) = handle_client(&inner, &mut stream).await {
        if err.kind() == std::io::ErrorKind::InvalidData {
            // A malformed frame from the same host is a local bug, not
            // something to limp along under.
            warn!("protocol violation from client: {err}");
            inner.record_error(DaemonError::Protocol(err.to_string()));
            inner.signal_shutdown().await;
        } else {
            debug!("dropping client connection: {err}");
        }
    }
}

async fn handle_client(inner: &ServerInner, stream: &mut UnixStream) -> std::io::Result<()> {
    let request = match read_request(stream).await? {
        Some(request) => request,
        // Probe connections (`status` subcommand liveness checks) connect
        // and hang up without sending anything.
        None => return Ok(()),
    };

    let response = match request.as_str() {
        "quit" => {
            debug!("client requested shutdown");
            inner.signal_shutdown().await;
            Vec::new()
        }
        "flush" => {
            inner.log.resync();
            Vec::new()
        }
        "status" => format!(
            "state: listening\nworktree: {}\n",
            inner.roots.worktree()
        )
        .into_bytes(),
        token if token.starts_with(TOKEN_HEADER) => answer_query(inner, token).await,
        other => {
            debug!("unrecognized command {other:?}");
            format!("error: unrecognized command '{other}'").into_bytes()
        }
    };

    stream.write_all(&response).await?;
    stream.shutdown().await
}

/// Read the single NUL-terminated request off a connection. `None` means
/// the client hung up without sending one.
async fn read_request(stream: &mut UnixStream) -> std::io::Result<Option<String>> {
    let (read_half, _) = stream.split();
    let mut reader = BufReader::new(read_half).take(MAX_REQUEST_LEN);
    let mut buf = Vec::new();
    reader.read_until(0, &mut buf).await?;

    match buf.last() {
        None => return Ok(None),
        Some(0) => {
            buf.pop();
        }
        Some(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request not NUL-terminated",
            ));
        }
    }

    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "non-UTF-8 request"))
}

/// Serve a token query: drain the event stream up to now via a cookie
/// roundtrip, consult the log, and serialize.
async fn answer_query(inner: &ServerInner, request: &str) -> Vec<u8> {
    if let Err(err) = inner.cookies.barrier().await {
        // Serving anyway is safe: anything the barrier would have waited
        // for shows up in the next response instead.
        warn!("cookie barrier failed: {err}");
    }

    let client = Token::parse(request).unwrap_or_else(|| {
        // Unparseable tokens are stale by definition; an impossible id
        // forces the trivial response.
        debug!("unparseable client token {request:?}");
        Token {
            token_id: String::new(),
            sequence_nr: 0,
        }
    });

    // The path list is moved out of the lock by `query`; serialization
    // happens with no lock held, so a slow client cannot stall the
    // listener or a concurrent resync.
    let result = inner.log.query(&client);
    let mut out = String::with_capacity(64 + 32 * result.paths.len());
    out.push_str(&result.token.to_string());
    out.push('\n');
    if result.trivial {
        out.push_str("/\n");
    } else {
        for path in &result.paths {
            out.push_str(path);
            out.push('\n');
        }
    }
    out.into_bytes()
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use camino::Utf8PathBuf;
    use fsmonitor_filewatch::WatchRoots;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::UnixStream,
        task::JoinHandle,
    };

    use super::{CloseReason, FsMonitorServer};
    use crate::{
        config::DaemonConfig,
        daemon::{connector::DaemonConnector, DaemonError, Paths},
    };

    struct TestDaemon {
        connector: DaemonConnector,
        roots: WatchRoots,
        serve: JoinHandle<Result<CloseReason, DaemonError>>,
        _tmp: tempfile::TempDir,
    }

    async fn boot() -> TestDaemon {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_owned())
            .unwrap()
            .canonicalize_utf8()
            .unwrap();
        std::fs::create_dir(root.join(".git")).unwrap();
        let roots = WatchRoots::new(root, None);
        let paths = Paths::from_gitdir(roots.metadata_dir());

        let config = DaemonConfig {
            ipc_threads: 2,
            start_timeout: Duration::from_secs(60),
            test_tokens: true,
        };
        let server = FsMonitorServer::new(roots.clone(), &config);
        let serve = tokio::spawn(server.serve(paths.clone()));

        let connector = DaemonConnector::new(paths);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !connector.is_listening().await {
            assert!(
                tokio::time::Instant::now() < deadline,
                "daemon did not start listening"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        TestDaemon {
            connector,
            roots,
            serve,
            _tmp: tmp,
        }
    }

    #[tokio::test]
    async fn test_query_lifecycle() {
        let daemon = boot().await;
        let worktree = daemon.roots.worktree().to_owned();

        // A token from before this daemon existed is answered trivially.
        let q0 = daemon.connector.query("builtin:prehistoric:0").await.unwrap();
        assert!(q0.trivial);
        assert!(q0.paths.is_empty());
        assert!(q0.token.starts_with("builtin:test_"));

        // Change the tree: the next query with the fresh token reports
        // exactly the touched paths, but never metadata churn.
        std::fs::write(worktree.join("a.txt"), "a").unwrap();
        std::fs::create_dir(worktree.join("sub")).unwrap();
        std::fs::write(worktree.join("sub/b.txt"), "b").unwrap();
        std::fs::write(worktree.join(".git/HEAD"), "ref: x").unwrap();

        let q1 = daemon.connector.query(&q0.token).await.unwrap();
        assert!(!q1.trivial);
        assert!(q1.paths.iter().any(|p| p == "a.txt"), "paths: {:?}", q1.paths);
        assert!(q1.paths.iter().any(|p| p == "sub/b.txt"));
        assert!(q1.paths.iter().all(|p| !p.contains(".git")));

        // No changes in between: idempotent re-query.
        let q2 = daemon.connector.query(&q1.token).await.unwrap();
        assert!(!q2.trivial);
        assert!(q2.paths.is_empty(), "paths: {:?}", q2.paths);
        assert_eq!(q2.token, q1.token);

        // Deletions are changes too.
        std::fs::remove_file(worktree.join("a.txt")).unwrap();
        let q3 = daemon.connector.query(&q2.token).await.unwrap();
        assert!(q3.paths.iter().any(|p| p == "a.txt"), "paths: {:?}", q3.paths);

        // `flush` resyncs: the old lineage dies, exactly one trivial
        // response follows.
        daemon.connector.flush().await.unwrap();
        let q4 = daemon.connector.query(&q3.token).await.unwrap();
        assert!(q4.trivial);
        assert_ne!(q4.token, q3.token);
        let q5 = daemon.connector.query(&q4.token).await.unwrap();
        assert!(!q5.trivial);

        daemon.connector.stop().await.unwrap();
        assert_eq!(daemon.serve.await.unwrap().unwrap(), CloseReason::Shutdown);
        assert!(!daemon.connector.is_listening().await);
    }

    #[tokio::test]
    async fn test_status_and_unknown_commands() {
        let daemon = boot().await;

        let status = daemon.connector.status().await.unwrap();
        assert!(status.contains("state: listening"));
        assert!(status.contains(daemon.roots.worktree().as_str()));

        let mut stream = UnixStream::connect(&daemon.connector.paths.sock_file)
            .await
            .unwrap();
        stream.write_all(b"frobnicate\0").await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert_eq!(response, "error: unrecognized command 'frobnicate'");

        daemon.connector.stop().await.unwrap();
        daemon.serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_second_daemon_refused() {
        let daemon = boot().await;

        let config = DaemonConfig {
            ipc_threads: 1,
            start_timeout: Duration::from_secs(60),
            test_tokens: true,
        };
        let second = FsMonitorServer::new(daemon.roots.clone(), &config);
        let result = second
            .serve(Paths::from_gitdir(daemon.roots.metadata_dir()))
            .await;
        assert!(
            matches!(result, Err(DaemonError::SocketOpen(_))),
            "second daemon must refuse to bind"
        );

        daemon.connector.stop().await.unwrap();
        daemon.serve.await.unwrap().unwrap();
    }
}
