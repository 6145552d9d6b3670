use super::lifecycle_event::WorkerId;
use drover_error::{DroverError, Result};
use drover_tracing::EventLogger;
use std::future::Future;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Handed to the work unit. Everything the work unit wants to keep running
/// after it returns must be spawned through here, so the worker knows when
/// in-flight work has drained during a graceful shutdown.
#[derive(Clone)]
pub struct WorkerContext {
    worker_id: Option<WorkerId>,
    tracker: TaskTracker,
    retiring: CancellationToken,
    failures: UnboundedSender<DroverError>,
    logger: EventLogger,
}

impl WorkerContext {
    pub(crate) fn new(
        worker_id: Option<WorkerId>,
        failures: UnboundedSender<DroverError>,
        logger: EventLogger,
    ) -> Self {
        Self {
            worker_id,
            tracker: TaskTracker::new(),
            retiring: CancellationToken::new(),
            failures,
            logger,
        }
    }

    pub fn worker_id(&self) -> Option<WorkerId> {
        self.worker_id
    }

    /// The worker's event logger, for work units that want their own lines in
    /// the lifecycle stream.
    pub fn logger(&self) -> &EventLogger {
        &self.logger
    }

    /// Runs `task` as tracked in-flight work. An `Err` ends the worker with
    /// the error's exit code.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let failures = self.failures.clone();
        self.tracker.spawn(async move {
            if let Err(e) = task.await {
                failures.send(e).ok();
            }
        });
    }

    /// Cancelled once this worker has accepted retirement. Tasks should stop
    /// taking new work when it fires and finish what they hold.
    pub fn retirement_token(&self) -> CancellationToken {
        self.retiring.clone()
    }

    pub fn is_retiring(&self) -> bool {
        self.retiring.is_cancelled()
    }

    pub async fn retired(&self) {
        self.retiring.cancelled().await
    }

    pub(crate) fn begin_retirement(&self) {
        self.retiring.cancel();
        self.tracker.close();
    }

    pub(crate) async fn drained(&self) {
        self.tracker.wait().await
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}
