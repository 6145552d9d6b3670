use crate::cluster::{
    lifecycle_event::{ClusterEvent, LifecycleEvent, WorkerId},
    pool::{Command, Pool},
    process_worker::ProcessWorker,
    signal::{raise_default, LifecycleSource, SignalListener},
};
use crate::options::Options;
use drover_error::{DroverError, Result};
use drover_tracing::{EventLogger, Source};
use nix::sys::signal::Signal;
use std::{collections::HashMap, time::Duration};
use tokio::{
    runtime::{Builder as RuntimeBuilder, Runtime},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::{sleep_until, Instant},
};
use drover_tracing::{error, info, warn};
use tracing::instrument;

/// Slack the supervisor gives workers beyond their own shutdown timeout
/// before it kills them outright.
pub const FORCE_KILL_GRACE: Duration = Duration::from_millis(1000);

pub(crate) struct SupervisorMode {
    pool: Pool,
    process_workers: HashMap<WorkerId, ProcessWorker>,
    events_tx: UnboundedSender<ClusterEvent>,
    worker_count: usize,
    shutdown_timeout: Duration,
    shutdown_deadline: Option<Instant>,
    logger: EventLogger,
}

impl SupervisorMode {
    pub fn new(mut options: Options) -> (Self, UnboundedReceiver<ClusterEvent>) {
        let logger = options.take_logger(Source::Supervisor);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                pool: Pool::new(logger.clone()),
                process_workers: HashMap::new(),
                events_tx,
                worker_count: options.workers,
                shutdown_timeout: options.shutdown_timeout,
                shutdown_deadline: None,
                logger,
            },
            events_rx,
        )
    }

    pub fn build_runtime(&self) -> Result<Runtime> {
        let mut builder: RuntimeBuilder = RuntimeBuilder::new_current_thread();
        Ok(builder
            .thread_name("drover-supervisor")
            .enable_io()
            .enable_time()
            .build()?)
    }

    #[instrument(skip_all, fields(mode = "supervisor", workers = self.worker_count))]
    pub fn run(mut self, events_rx: UnboundedReceiver<ClusterEvent>) -> Result<()> {
        let runtime = self.build_runtime()?;
        runtime.block_on(async move {
            // Listen before forking so an early signal is never lost.
            let signals = SignalListener::supervisor()?;
            self.serve(signals, events_rx).await;
            Ok(())
        })
    }

    async fn serve<S: LifecycleSource>(
        &mut self,
        mut signals: S,
        mut events_rx: UnboundedReceiver<ClusterEvent>,
    ) {
        let commands = self.pool.start(self.worker_count);
        self.execute_all(commands);

        let mut signals_open = true;
        while !self.pool.is_finished() {
            let deadline = self.shutdown_deadline;
            tokio::select! {
                Some(event) = events_rx.recv() => {
                    if let ClusterEvent::Exited(id, _) = &event {
                        self.process_workers.remove(id);
                    }
                    let commands = self.pool.on_cluster_event(event);
                    self.execute_all(commands);
                }
                event = signals.recv(), if signals_open => match event {
                    Some(event) => self.handle_lifecycle_event(event),
                    None => signals_open = false,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.shutdown_deadline = None;
                    self.force_kill_remaining();
                }
            }
        }
        info!(
            "All workers exited after {} fork(s), supervisor stopping",
            self.pool.forks_requested()
        );
    }

    fn handle_lifecycle_event(&mut self, event: LifecycleEvent) {
        let commands = self.pool.on_lifecycle_event(event);
        self.execute_all(commands);
    }

    fn execute_all(&mut self, commands: Vec<Command>) {
        for command in commands {
            if let Err(e) = self.execute(command) {
                error!("Error in lifecycle command: {}", e);
            }
        }
    }

    fn execute(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Fork(id) => match ProcessWorker::boot(id, self.events_tx.clone()) {
                Ok(worker) => {
                    self.pool.worker_started(id, worker.child_pid);
                    self.process_workers.insert(id, worker);
                    Ok(())
                }
                Err(e) => {
                    self.pool.worker_failed_to_start(id);
                    Err(e)
                }
            },
            Command::Retire(id, pid) => match self.process_workers.get(&id) {
                Some(worker) => worker.request_shutdown(),
                None => Err(DroverError::Signal(
                    pid.as_raw(),
                    format!("worker {} is not running", id),
                )),
            },
            Command::Interrupt => {
                raise_default(Signal::SIGINT)?;
                std::process::exit(128 + Signal::SIGINT as i32)
            }
            Command::ArmShutdownDeadline => {
                self.shutdown_deadline =
                    Some(Instant::now() + self.shutdown_timeout + FORCE_KILL_GRACE);
                Ok(())
            }
        }
    }

    fn force_kill_remaining(&mut self) {
        if self.process_workers.is_empty() {
            return;
        }
        warn!("Graceful shutdown timeout reached, force killing remaining workers");
        self.logger
            .event("shutdown timeout exceeded, killing remaining workers");
        for worker in self.process_workers.values() {
            if let Err(e) = worker.force_kill() {
                error!("Failed to force kill worker {}: {}", worker.worker_id, e);
            }
        }
    }
}
