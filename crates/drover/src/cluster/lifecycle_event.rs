use nix::sys::signal::Signal;
use std::{fmt, process::ExitStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Control events, raised by OS signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// INT: terminate immediately, no drain.
    Interrupt,
    /// TERM or QUIT: graceful shutdown (supervisor) or retirement (worker).
    Shutdown(Signal),
    /// TTIN
    IncreaseWorkers,
    /// TTOU
    DecreaseWorkers,
}

impl LifecycleEvent {
    /// Signal name without the `SIG` prefix, as used in the event stream.
    pub fn signal_name(&self) -> &'static str {
        match self {
            LifecycleEvent::Interrupt => "INT",
            LifecycleEvent::Shutdown(signal) => short_name(*signal),
            LifecycleEvent::IncreaseWorkers => "TTIN",
            LifecycleEvent::DecreaseWorkers => "TTOU",
        }
    }
}

pub(crate) fn short_name(signal: Signal) -> &'static str {
    let name = signal.as_str();
    name.strip_prefix("SIG").unwrap_or(name)
}

/// Notifications about one worker process, delivered to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    Online(WorkerId),
    Disconnected(WorkerId),
    Exited(WorkerId, TerminationReason),
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Exited(i32),
    Signaled(Signal),
    Unknown,
}

impl From<ExitStatus> for TerminationReason {
    fn from(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        if let Some(code) = status.code() {
            return TerminationReason::Exited(code);
        }
        status
            .signal()
            .and_then(|signum| Signal::try_from(signum).ok())
            .map(TerminationReason::Signaled)
            .unwrap_or(TerminationReason::Unknown)
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Exited(code) => write!(f, "exited with code {}", code),
            TerminationReason::Signaled(signal) => write!(f, "killed by signal {}", signal),
            TerminationReason::Unknown => write!(f, "unknown reason"),
        }
    }
}
