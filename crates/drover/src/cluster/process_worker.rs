use super::{
    channel::{setup_ipc_channel, watch_worker},
    lifecycle_event::{ClusterEvent, TerminationReason, WorkerId},
    signal::RETIREMENT_SIGNAL,
};
use crate::env::{DROVER_CHANNEL_FD, DROVER_WORKER_ID};
use drover_error::{DroverError, Result};
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use std::os::fd::AsRawFd;
use tokio::{process::Command, sync::mpsc::UnboundedSender};
use drover_tracing::{debug, error};
use tracing::instrument;

/// Supervisor-side handle to one running worker process.
#[derive(Debug, Clone)]
pub(crate) struct ProcessWorker {
    pub worker_id: WorkerId,
    pub child_pid: Pid,
}

impl ProcessWorker {
    /// Re-executes the current binary as worker `worker_id` and starts the
    /// tasks that report its lifecycle back on `events`.
    #[instrument(skip_all, fields(worker_id = %worker_id))]
    pub(crate) fn boot(
        worker_id: WorkerId,
        events: UnboundedSender<ClusterEvent>,
    ) -> Result<Self> {
        let (parent_fd, child_fd) = setup_ipc_channel()?;
        let exe = std::env::current_exe()?;

        let mut command = Command::new(exe);
        command
            .args(std::env::args_os().skip(1))
            .env(DROVER_WORKER_ID, worker_id.to_string())
            .env(DROVER_CHANNEL_FD, child_fd.as_raw_fd().to_string())
            .kill_on_drop(false);

        let mut child = command
            .spawn()
            .map_err(|e| DroverError::Spawn(worker_id.0, e.to_string()))?;
        // Only the worker may hold its end, or its EOF never reaches us.
        drop(child_fd);

        let child_pid = child
            .id()
            .map(|pid| Pid::from_raw(pid as i32))
            .ok_or_else(|| DroverError::Spawn(worker_id.0, "exited before start".to_string()))?;
        debug!("Started worker {} as pid {}", worker_id, child_pid);

        tokio::spawn(watch_worker(parent_fd, worker_id, events.clone()));
        tokio::spawn(async move {
            let reason = match child.wait().await {
                Ok(status) => TerminationReason::from(status),
                Err(e) => {
                    error!("Failed to wait on worker {}: {}", worker_id, e);
                    TerminationReason::Unknown
                }
            };
            events.send(ClusterEvent::Exited(worker_id, reason)).ok();
        });

        Ok(Self {
            worker_id,
            child_pid,
        })
    }

    pub(crate) fn request_shutdown(&self) -> Result<()> {
        self.send(RETIREMENT_SIGNAL)
    }

    pub(crate) fn force_kill(&self) -> Result<()> {
        self.send(Signal::SIGKILL)
    }

    fn send(&self, signal: Signal) -> Result<()> {
        match kill(self.child_pid, signal) {
            Ok(()) => Ok(()),
            // Already gone; its exit is on the way.
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(DroverError::Signal(self.child_pid.as_raw(), e.to_string())),
        }
    }
}
