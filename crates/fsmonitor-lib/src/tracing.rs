//! Log subscriber setup. Foreground runs log to stderr; a background
//! daemon has its stdio on the null device, so it logs to a file inside
//! the metadata directory through a non-blocking appender.

use camino::Utf8Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub struct FsMonitorSubscriber {
    // The non-blocking file appender only flushes while this guard is
    // alive; it is held until process exit.
    _guard: Option<WorkerGuard>,
}

pub fn init(verbosity: u8, log_file: Option<&Utf8Path>) -> FsMonitorSubscriber {
    let default_directive = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    match log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or(Utf8Path::new("."));
            let file_name = path.file_name().unwrap_or("fsmonitor--daemon.log");
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            FsMonitorSubscriber {
                _guard: Some(guard),
            }
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            FsMonitorSubscriber { _guard: None }
        }
    }
}
