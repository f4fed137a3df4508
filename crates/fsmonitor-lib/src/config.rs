//! Daemon configuration, built once at boot and passed to whatever needs
//! it. Resolution order per setting: command-line flag, then the repo's
//! `fsmonitor.*` git config key, then the default.

use std::time::Duration;

use thiserror::Error;

use crate::git::{GitError, Repo};

pub const IPC_THREADS_KEY: &str = "fsmonitor.ipcthreads";
pub const START_TIMEOUT_KEY: &str = "fsmonitor.starttimeout";
/// When this environment variable is set, token ids take the deterministic
/// `test_NNNNNNNN` form.
pub const TOKEN_TEST_ENV: &str = "FSMONITOR_TOKEN_TEST";

pub const DEFAULT_IPC_THREADS: usize = 8;
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{IPC_THREADS_KEY} must be a positive integer, got '{0}'")]
    InvalidIpcThreads(String),
    #[error("{START_TIMEOUT_KEY} must be a non-negative number of seconds, got '{0}'")]
    InvalidStartTimeout(String),
    #[error(transparent)]
    Git(#[from] GitError),
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Upper bound on concurrently served IPC clients.
    pub ipc_threads: usize,
    /// How long `start` waits for the background daemon to come up.
    pub start_timeout: Duration,
    pub test_tokens: bool,
}

impl DaemonConfig {
    pub fn resolve(
        repo: &Repo,
        ipc_threads_flag: Option<usize>,
        start_timeout_flag: Option<u64>,
    ) -> Result<Self, ConfigError> {
        let ipc_threads = match ipc_threads_flag {
            Some(n) if n >= 1 => n,
            Some(n) => return Err(ConfigError::InvalidIpcThreads(n.to_string())),
            None => match repo.config_get(IPC_THREADS_KEY)? {
                Some(value) => parse_ipc_threads(&value)?,
                None => DEFAULT_IPC_THREADS,
            },
        };
        let start_timeout = match start_timeout_flag {
            Some(seconds) => Duration::from_secs(seconds),
            None => match repo.config_get(START_TIMEOUT_KEY)? {
                Some(value) => parse_start_timeout(&value)?,
                None => DEFAULT_START_TIMEOUT,
            },
        };
        Ok(Self {
            ipc_threads,
            start_timeout,
            test_tokens: std::env::var_os(TOKEN_TEST_ENV).is_some(),
        })
    }
}

fn parse_ipc_threads(value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|n| *n >= 1)
        .ok_or_else(|| ConfigError::InvalidIpcThreads(value.to_owned()))
}

fn parse_start_timeout(value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::InvalidStartTimeout(value.to_owned()))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use test_case::test_case;

    use super::{parse_ipc_threads, parse_start_timeout};

    #[test_case("8", Some(8))]
    #[test_case(" 2 ", Some(2))]
    #[test_case("0", None ; "zero threads refused")]
    #[test_case("-1", None)]
    #[test_case("many", None)]
    fn ipc_threads_validation(value: &str, expected: Option<usize>) {
        assert_eq!(parse_ipc_threads(value).ok(), expected);
    }

    #[test_case("60", Some(Duration::from_secs(60)))]
    #[test_case("0", Some(Duration::ZERO) ; "zero timeout allowed")]
    #[test_case("-5", None)]
    #[test_case("1m", None)]
    fn start_timeout_validation(value: &str, expected: Option<Duration>) {
        assert_eq!(parse_start_timeout(value).ok(), expected);
    }
}
