use crate::cluster::lifecycle_event::WorkerId;
use drover_error::{DroverError, Result};
use std::{env::var, os::fd::RawFd};

/// *DROVER_WORKER_ID* - Set by the supervisor on every process it starts.
/// Its presence is what makes a process a worker.
pub const DROVER_WORKER_ID: &str = "DROVER_WORKER_ID";

/// *DROVER_CHANNEL_FD* - Descriptor number of the worker's end of the
/// lifecycle channel, inherited across exec.
pub const DROVER_CHANNEL_FD: &str = "DROVER_CHANNEL_FD";

/// *DROVER_WORKERS* - Overrides the number of workers started.
pub const DROVER_WORKERS: &str = "DROVER_WORKERS";

/// *DROVER_SHUTDOWN_TIMEOUT_MS* - Overrides the graceful shutdown window.
pub const DROVER_SHUTDOWN_TIMEOUT_MS: &str = "DROVER_SHUTDOWN_TIMEOUT_MS";

/// *DROVER_VERBOSE* - `false`/`0` silences the lifecycle event stream.
pub const DROVER_VERBOSE: &str = "DROVER_VERBOSE";

pub fn is_worker() -> bool {
    std::env::var_os(DROVER_WORKER_ID).is_some()
}

pub(crate) fn worker_id() -> Result<Option<WorkerId>> {
    match var(DROVER_WORKER_ID) {
        Ok(id) => id.trim().parse().map(|id| Some(WorkerId(id))).map_err(|_| {
            DroverError::InvalidConfig(format!("{} is not a worker id: {:?}", DROVER_WORKER_ID, id))
        }),
        Err(_) => Ok(None),
    }
}

pub(crate) fn channel_fd() -> Result<RawFd> {
    let fd = var(DROVER_CHANNEL_FD)
        .map_err(|_| DroverError::Channel(format!("{} is not set", DROVER_CHANNEL_FD)))?;
    fd.trim()
        .parse()
        .map_err(|_| DroverError::Channel(format!("{} is not a descriptor: {:?}", DROVER_CHANNEL_FD, fd)))
}
