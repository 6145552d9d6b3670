use crate::env::{DROVER_SHUTDOWN_TIMEOUT_MS, DROVER_VERBOSE, DROVER_WORKERS};
use derive_more::Debug;
use drover_error::{DroverError, Result};
use drover_tracing::{EventLogger, Sink, Source};
use std::time::Duration;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(5000);
pub const MIN_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(1);
pub const MAX_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Pool configuration, shared by the supervisor and every worker.
///
/// Both roles run the same `drover::run` call, so a worker sees exactly the
/// options its supervisor was started with.
#[derive(Debug)]
pub struct Options {
    pub workers: usize,
    pub shutdown_timeout: Duration,
    pub verbose: bool,
    #[debug(skip)]
    pub log_stream: Option<Sink>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            verbose: true,
            log_stream: None,
        }
    }
}

impl Options {
    /// Defaults, overridden by `DROVER_WORKERS`, `DROVER_SHUTDOWN_TIMEOUT_MS`
    /// and `DROVER_VERBOSE` when set.
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env(|key| std::env::var(key).ok())
    }

    pub(crate) fn merge_env<L>(mut self, lookup: L) -> Result<Self>
    where
        L: Fn(&str) -> Option<String>,
    {
        if let Some(workers) = lookup(DROVER_WORKERS) {
            self.workers = workers.trim().parse().map_err(|_| {
                DroverError::InvalidConfig(format!("{}={:?}", DROVER_WORKERS, workers))
            })?;
        }
        if let Some(timeout) = lookup(DROVER_SHUTDOWN_TIMEOUT_MS) {
            let millis: u64 = timeout.trim().parse().map_err(|_| {
                DroverError::InvalidConfig(format!("{}={:?}", DROVER_SHUTDOWN_TIMEOUT_MS, timeout))
            })?;
            self.shutdown_timeout = Duration::from_millis(millis);
        }
        if let Some(verbose) = lookup(DROVER_VERBOSE) {
            self.verbose = match verbose.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(DroverError::InvalidConfig(format!(
                        "{}={:?}",
                        DROVER_VERBOSE, verbose
                    )))
                }
            };
        }
        Ok(self)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_log_stream(mut self, log_stream: Sink) -> Self {
        self.log_stream = Some(log_stream);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(DroverError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        validate_shutdown_timeout(self.shutdown_timeout)
    }

    /// Builds the event logger for `source`, taking ownership of the log stream.
    pub(crate) fn take_logger(&mut self, source: Source) -> EventLogger {
        EventLogger::new(source, self.verbose, self.log_stream.take())
    }
}

/// Deadlines are computed as `now + shutdown_timeout`, so the window must be
/// long enough to matter and short enough to add to an `Instant`.
pub(crate) fn validate_shutdown_timeout(shutdown_timeout: Duration) -> Result<()> {
    if !(MIN_SHUTDOWN_TIMEOUT..=MAX_SHUTDOWN_TIMEOUT).contains(&shutdown_timeout) {
        return Err(DroverError::InvalidConfig(format!(
            "shutdown_timeout must be between {:?} and {:?}, got {:?}",
            MIN_SHUTDOWN_TIMEOUT, MAX_SHUTDOWN_TIMEOUT, shutdown_timeout
        )));
    }
    Ok(())
}
