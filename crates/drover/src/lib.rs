//! Single-host process supervisor.
//!
//! `drover::run` is called from `main` by both roles. In the supervisor it
//! starts `workers` copies of the current binary and keeps the pool at size,
//! replacing workers that die unexpectedly and responding to signals:
//!
//! | signal | supervisor | worker |
//! |---|---|---|
//! | INT | exit immediately | exit immediately |
//! | TERM, QUIT | retire every worker, exit once drained | retire: drain, force exit(1) after the timeout |
//! | TTIN | start one more worker | |
//! | TTOU | retire one worker | |
//!
//! In a worker it runs the work unit once, then holds the process until the
//! worker is retired.

pub mod cluster;
pub mod env;
pub mod options;

pub use cluster::{
    lifecycle_event::{ClusterEvent, LifecycleEvent, TerminationReason, WorkerId},
    signal::RETIREMENT_SIGNAL,
    worker_context::WorkerContext,
};
pub use drover_error::{DroverError, Result};
pub use env::is_worker;
pub use options::Options;

use cluster::serve_strategy::ServeStrategy;

/// Runs the supervisor or, in a process it started, the worker.
///
/// In the supervisor this returns once a graceful shutdown has completed. In
/// a worker it only returns when `work` fails, with that error; otherwise
/// the worker process exits from within.
pub fn run<F>(work: F, options: Options) -> Result<()>
where
    F: Fn(&WorkerContext) -> Result<()>,
{
    ServeStrategy::build(work, options)?.run()
}
