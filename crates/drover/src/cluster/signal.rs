use super::lifecycle_event::LifecycleEvent;
use drover_error::Result;
use nix::sys::signal::{self, SigHandler, Signal};
use std::future::{pending, Future};
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::mpsc;

/// Signal the supervisor sends a worker to retire it, for both graceful
/// shutdown and scale-down.
pub const RETIREMENT_SIGNAL: Signal = Signal::SIGTERM;

/// Anything the lifecycle loops can pull control events from.
pub trait LifecycleSource {
    fn recv(&mut self) -> impl Future<Output = Option<LifecycleEvent>>;
}

/// OS signal streams mapped to [`LifecycleEvent`]s.
pub struct SignalListener {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
    sigquit: tokio::signal::unix::Signal,
    sigttin: Option<tokio::signal::unix::Signal>,
    sigttou: Option<tokio::signal::unix::Signal>,
}

impl SignalListener {
    /// INT, TERM, QUIT, TTIN and TTOU.
    pub fn supervisor() -> Result<Self> {
        Ok(Self {
            sigint: unix_signal(SignalKind::interrupt())?,
            sigterm: unix_signal(SignalKind::terminate())?,
            sigquit: unix_signal(SignalKind::quit())?,
            sigttin: Some(unix_signal(SignalKind::from_raw(Signal::SIGTTIN as i32))?),
            sigttou: Some(unix_signal(SignalKind::from_raw(Signal::SIGTTOU as i32))?),
        })
    }

    /// INT, TERM and QUIT.
    pub fn worker() -> Result<Self> {
        Ok(Self {
            sigint: unix_signal(SignalKind::interrupt())?,
            sigterm: unix_signal(SignalKind::terminate())?,
            sigquit: unix_signal(SignalKind::quit())?,
            sigttin: None,
            sigttou: None,
        })
    }
}

async fn recv_optional(signal: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match signal {
        Some(signal) => signal.recv().await,
        None => pending().await,
    }
}

impl LifecycleSource for SignalListener {
    async fn recv(&mut self) -> Option<LifecycleEvent> {
        tokio::select! {
            Some(_) = self.sigint.recv() => Some(LifecycleEvent::Interrupt),
            Some(_) = self.sigterm.recv() => Some(LifecycleEvent::Shutdown(Signal::SIGTERM)),
            Some(_) = self.sigquit.recv() => Some(LifecycleEvent::Shutdown(Signal::SIGQUIT)),
            Some(_) = recv_optional(&mut self.sigttin) => Some(LifecycleEvent::IncreaseWorkers),
            Some(_) = recv_optional(&mut self.sigttou) => Some(LifecycleEvent::DecreaseWorkers),
            else => None,
        }
    }
}

impl LifecycleSource for mpsc::UnboundedReceiver<LifecycleEvent> {
    async fn recv(&mut self) -> Option<LifecycleEvent> {
        mpsc::UnboundedReceiver::recv(self).await
    }
}

/// Restores the default disposition for `signal` and raises it against the
/// current process. For INT this does not return.
pub fn raise_default(signal: Signal) -> Result<()> {
    unsafe { signal::signal(signal, SigHandler::SigDfl) }?;
    signal::raise(signal)?;
    Ok(())
}
