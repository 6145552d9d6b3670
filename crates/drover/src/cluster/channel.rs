//! Child-to-parent lifecycle channel.
//!
//! One Unix stream socket pair per worker. The worker writes a single
//! `online` line once its work unit has started; the supervisor treats EOF
//! on its end as the worker disconnecting, whether the worker closed it on
//! purpose or the process died.

use super::lifecycle_event::{ClusterEvent, WorkerId};
use drover_error::{DroverError, Result};
use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    sys::socket::{socketpair, AddressFamily, SockFlag, SockType},
};
use std::{
    future::pending,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::UnixStream,
    sync::mpsc::UnboundedSender,
};
use drover_tracing::debug;

const ONLINE: &str = "online";

/// Returns `(parent, child)`. The parent end is close-on-exec; the child end
/// is left inheritable so it survives into the worker process.
pub(crate) fn setup_ipc_channel() -> Result<(OwnedFd, OwnedFd)> {
    let (parent, child) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )?;
    fcntl(parent.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok((parent, child))
}

fn into_tokio_stream(fd: OwnedFd) -> Result<UnixStream> {
    let stream = std::os::unix::net::UnixStream::from(fd);
    stream.set_nonblocking(true)?;
    Ok(UnixStream::from_std(stream)?)
}

/// Supervisor side: forwards `online` and the final disconnect for one worker.
pub(crate) async fn watch_worker(
    parent: OwnedFd,
    worker_id: WorkerId,
    events: UnboundedSender<ClusterEvent>,
) {
    let stream = match into_tokio_stream(parent) {
        Ok(stream) => stream,
        Err(e) => {
            debug!("Lifecycle channel for worker {} unusable: {}", worker_id, e);
            events.send(ClusterEvent::Disconnected(worker_id)).ok();
            return;
        }
    };
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line == ONLINE => {
                events.send(ClusterEvent::Online(worker_id)).ok();
            }
            Ok(Some(line)) => debug!("Unexpected message from worker {}: {:?}", worker_id, line),
            Ok(None) => break,
            Err(e) => {
                debug!("Lifecycle channel for worker {} failed: {}", worker_id, e);
                break;
            }
        }
    }
    events.send(ClusterEvent::Disconnected(worker_id)).ok();
}

/// Worker side of the channel.
#[derive(Debug)]
pub struct WorkerChannel {
    stream: Option<UnixStream>,
}

impl WorkerChannel {
    /// Wraps the worker end. Must be called from within a runtime.
    pub fn new(fd: OwnedFd) -> Result<Self> {
        // Keep it out of anything the work unit spawns, so closing it here
        // is what the supervisor sees.
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        Ok(Self {
            stream: Some(into_tokio_stream(fd)?),
        })
    }

    /// Takes ownership of the inherited descriptor named by `DROVER_CHANNEL_FD`.
    pub(crate) fn inherited_fd(fd: RawFd) -> Result<OwnedFd> {
        fcntl(fd, FcntlArg::F_GETFD)
            .map_err(|e| DroverError::Channel(format!("descriptor {} is not open: {}", fd, e)))?;
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    #[cfg(test)]
    pub(crate) fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn announce_online(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(DroverError::Channel("channel already closed".to_string()));
        };
        stream.write_all(format!("{}\n", ONLINE).as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Stops this process being counted as live by the supervisor.
    pub fn close(&mut self) {
        self.stream.take();
    }

    /// Completes when the supervisor end goes away. Never completes once
    /// this end has been closed.
    pub async fn closed(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return pending().await;
        };
        let mut buf = [0u8; 64];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    }
}
