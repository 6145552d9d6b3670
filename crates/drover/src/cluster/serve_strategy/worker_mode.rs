use crate::cluster::{
    channel::WorkerChannel,
    lifecycle_event::{LifecycleEvent, WorkerId},
    signal::{raise_default, LifecycleSource, SignalListener},
    worker_context::WorkerContext,
};
use crate::env;
use crate::options::{validate_shutdown_timeout, Options};
use drover_error::{DroverError, Result, FAILURE_EXIT_CODE};
use drover_tracing::{EventLogger, Source};
use nix::sys::signal::Signal;
use std::time::Duration;
use tokio::{
    runtime::{Builder as RuntimeBuilder, Runtime},
    sync::mpsc::{self, UnboundedReceiver},
    time::{sleep_until, Instant},
};
use drover_tracing::{debug, error, warn};

/// Exit status for a worker that stops because its supervisor vanished.
const ORPHANED_EXIT_CODE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retirement {
    Running,
    Retiring,
}

/// How the worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Status(i32),
    /// INT: the caller must re-raise it with the default disposition.
    Interrupted,
}

/// Worker lifecycle guard: runs the work unit once, then holds the process
/// until it is retired, interrupted or orphaned.
pub struct WorkerMode<S> {
    context: WorkerContext,
    failures: UnboundedReceiver<DroverError>,
    channel: WorkerChannel,
    signals: S,
    logger: EventLogger,
    shutdown_timeout: Duration,
    retirement: Retirement,
}

impl<S: LifecycleSource> WorkerMode<S> {
    /// `signals` must already be listening. Calls `work` exactly once; an
    /// error from it is returned unchanged. An out-of-range
    /// `shutdown_timeout` fails before `work` runs.
    pub async fn start<F>(
        worker_id: Option<WorkerId>,
        work: &F,
        channel: WorkerChannel,
        signals: S,
        logger: EventLogger,
        shutdown_timeout: Duration,
    ) -> Result<Self>
    where
        F: Fn(&WorkerContext) -> Result<()>,
    {
        validate_shutdown_timeout(shutdown_timeout)?;
        let (failures_tx, failures) = mpsc::unbounded_channel();
        let context = WorkerContext::new(worker_id, failures_tx, logger.clone());
        work(&context)?;

        let mut mode = Self {
            context,
            failures,
            channel,
            signals,
            logger,
            shutdown_timeout,
            retirement: Retirement::Running,
        };
        if let Err(e) = mode.channel.announce_online().await {
            warn!("Failed to announce worker online: {}", e);
        }
        Ok(mode)
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &WorkerContext {
        &self.context
    }

    pub async fn run_until_exit(mut self) -> WorkerExit {
        let mut deadline: Option<Instant> = None;
        let mut first_failure: Option<i32> = None;
        let mut signals_open = true;

        loop {
            let retiring = self.retirement == Retirement::Retiring;
            tokio::select! {
                event = self.signals.recv(), if signals_open => match event {
                    Some(LifecycleEvent::Interrupt) => {
                        self.logger.event("received INT, immediately shutting down");
                        return WorkerExit::Interrupted;
                    }
                    Some(event @ LifecycleEvent::Shutdown(_)) => {
                        if let Some(at) = self.retire(event) {
                            deadline = Some(at);
                        }
                    }
                    Some(event) => debug!("Ignoring {:?} in worker", event),
                    None => signals_open = false,
                },
                Some(failure) = self.failures.recv() => {
                    if retiring {
                        error!("Work failed during shutdown: {}", failure);
                        first_failure.get_or_insert(failure.exit_code());
                    } else {
                        error!("Work failed: {}", failure);
                        return WorkerExit::Status(failure.exit_code());
                    }
                }
                _ = self.context.drained(), if retiring => {
                    while let Ok(failure) = self.failures.try_recv() {
                        first_failure.get_or_insert(failure.exit_code());
                    }
                    return WorkerExit::Status(first_failure.unwrap_or(0));
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.logger.event("shutdown timeout exceeded, forcing shutdown");
                    return WorkerExit::Status(FAILURE_EXIT_CODE);
                }
                _ = self.channel.closed(), if !retiring => {
                    self.logger.event("supervisor disconnected, exiting");
                    return WorkerExit::Status(ORPHANED_EXIT_CODE);
                }
            }
        }
    }

    /// First retirement request starts the shutdown window and returns its
    /// deadline; later ones are ignored.
    fn retire(&mut self, event: LifecycleEvent) -> Option<Instant> {
        if self.retirement == Retirement::Retiring {
            debug!("Ignoring {}, already shutting down", event.signal_name());
            return None;
        }
        self.retirement = Retirement::Retiring;
        self.logger.event(format!(
            "received {}, attempting graceful shutdown",
            event.signal_name()
        ));
        let deadline = Instant::now() + self.shutdown_timeout;
        self.context.begin_retirement();
        self.channel.close();
        debug!("{} task(s) in flight at retirement", self.context.in_flight());
        Some(deadline)
    }
}

pub(crate) fn build_runtime() -> Result<Runtime> {
    let mut builder: RuntimeBuilder = RuntimeBuilder::new_current_thread();
    Ok(builder
        .thread_name("drover-worker")
        .enable_io()
        .enable_time()
        .build()?)
}

/// Worker-process entry point. Only returns on a start-up failure; every
/// other path ends the process.
pub(crate) fn run<F>(worker_id: WorkerId, work: F, mut options: Options) -> Result<()>
where
    F: Fn(&WorkerContext) -> Result<()>,
{
    let logger = options.take_logger(Source::Worker);
    let channel_fd = WorkerChannel::inherited_fd(env::channel_fd()?)?;
    let runtime = build_runtime()?;

    let exit = runtime.block_on(async {
        let signals = SignalListener::worker()?;
        let channel = WorkerChannel::new(channel_fd)?;
        let mode = WorkerMode::start(
            Some(worker_id),
            &work,
            channel,
            signals,
            logger,
            options.shutdown_timeout,
        )
        .await?;
        Ok::<_, DroverError>(mode.run_until_exit().await)
    })?;

    match exit {
        WorkerExit::Interrupted => {
            raise_default(Signal::SIGINT)?;
            std::process::exit(128 + Signal::SIGINT as i32)
        }
        WorkerExit::Status(code) => std::process::exit(code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::channel::setup_ipc_channel;
    use crate::options::MAX_SHUTDOWN_TIMEOUT;
    use drover_tracing::MemorySink;
    use std::{
        os::fd::OwnedFd,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };
    use tokio::{
        io::{AsyncBufReadExt, BufReader},
        net::UnixStream,
        sync::mpsc::UnboundedSender,
        time::sleep,
    };

    const TIMEOUT: Duration = Duration::from_millis(200);

    struct Harness {
        signals: UnboundedSender<LifecycleEvent>,
        parent: Option<BufReader<UnixStream>>,
        sink: MemorySink,
    }

    impl Harness {
        fn lines(&self) -> Vec<String> {
            self.sink.lines()
        }

        fn term(&self) {
            self.signals
                .send(LifecycleEvent::Shutdown(Signal::SIGTERM))
                .unwrap();
        }

        async fn read_parent_line(&mut self) -> Option<String> {
            let parent = self.parent.as_mut()?;
            let mut line = String::new();
            match parent.read_line(&mut line).await {
                Ok(0) | Err(_) => None,
                Ok(_) => Some(line),
            }
        }
    }

    fn parent_stream(fd: OwnedFd) -> BufReader<UnixStream> {
        let stream = std::os::unix::net::UnixStream::from(fd);
        stream.set_nonblocking(true).unwrap();
        BufReader::new(UnixStream::from_std(stream).unwrap())
    }

    async fn start<F>(work: F) -> Result<(WorkerMode<UnboundedReceiver<LifecycleEvent>>, Harness)>
    where
        F: Fn(&WorkerContext) -> Result<()>,
    {
        start_with_timeout(work, TIMEOUT).await
    }

    async fn start_with_timeout<F>(
        work: F,
        shutdown_timeout: Duration,
    ) -> Result<(WorkerMode<UnboundedReceiver<LifecycleEvent>>, Harness)>
    where
        F: Fn(&WorkerContext) -> Result<()>,
    {
        let (parent, child) = setup_ipc_channel().unwrap();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let sink = MemorySink::new();
        let logger = EventLogger::with_pid(Source::Worker, 77, Some(sink.boxed()));
        let mode = WorkerMode::start(
            Some(WorkerId(1)),
            &work,
            WorkerChannel::new(child).unwrap(),
            signals_rx,
            logger,
            shutdown_timeout,
        )
        .await?;
        Ok((
            mode,
            Harness {
                signals: signals_tx,
                parent: Some(parent_stream(parent)),
                sink,
            },
        ))
    }

    fn line(event: &str) -> String {
        format!("source=drover:worker pid=77 event=\"{}\"", event)
    }

    fn sleeper(millis: u64) -> impl Fn(&WorkerContext) -> Result<()> {
        move |ctx: &WorkerContext| {
            ctx.spawn(async move {
                sleep(Duration::from_millis(millis)).await;
                Ok(())
            });
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_unit_runs_once_and_announces_online() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (mode, mut harness) = start(move |ctx: &WorkerContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert_eq!(ctx.worker_id(), Some(WorkerId(1)));
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.read_parent_line().await.as_deref(), Some("online\n"));
        assert!(!mode.context().is_retiring());
        assert!(harness.lines().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_unit_error_propagates() {
        let result = start(|_: &WorkerContext| Err(DroverError::work("bind failed"))).await;
        assert_eq!(
            result.err(),
            Some(DroverError::Work("bind failed".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_fails_before_work_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        for timeout in [Duration::MAX, Duration::from_nanos(1)] {
            let counter = calls.clone();
            let result = start_with_timeout(
                move |_: &WorkerContext| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                timeout,
            )
            .await;
            assert!(matches!(result, Err(DroverError::InvalidConfig(_))));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_longest_timeout_still_retires() {
        let (mode, harness) = start_with_timeout(sleeper(50), MAX_SHUTDOWN_TIMEOUT)
            .await
            .unwrap();
        harness.term();
        assert_eq!(mode.run_until_exit().await, WorkerExit::Status(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retirement_drains_in_flight_work() {
        let (mode, mut harness) = start(sleeper(50)).await.unwrap();
        assert_eq!(harness.read_parent_line().await.as_deref(), Some("online\n"));
        harness.term();

        let started = Instant::now();
        assert_eq!(mode.run_until_exit().await, WorkerExit::Status(0));
        assert!(started.elapsed() < TIMEOUT);
        assert_eq!(
            harness.lines(),
            vec![line("received TERM, attempting graceful shutdown")]
        );
        // Closing our end is the disconnect the supervisor sees.
        assert_eq!(harness.read_parent_line().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_exits_right_after_retirement() {
        let (mode, harness) = start(|_: &WorkerContext| Ok(())).await.unwrap();
        harness.term();
        assert_eq!(mode.run_until_exit().await, WorkerExit::Status(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retirement_timeout_forces_status_one() {
        let (mode, harness) = start(sleeper(10_000)).await.unwrap();
        harness.term();

        let started = Instant::now();
        assert_eq!(mode.run_until_exit().await, WorkerExit::Status(1));
        let elapsed = started.elapsed();
        assert!(elapsed >= TIMEOUT);
        assert!(elapsed < TIMEOUT + Duration::from_millis(50));
        assert_eq!(
            harness.lines(),
            vec![
                line("received TERM, attempting graceful shutdown"),
                line("shutdown timeout exceeded, forcing shutdown"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_retirement_is_ignored() {
        let (mode, harness) = start(sleeper(100)).await.unwrap();
        harness.term();
        harness.term();
        harness
            .signals
            .send(LifecycleEvent::Shutdown(Signal::SIGQUIT))
            .unwrap();
        assert_eq!(mode.run_until_exit().await, WorkerExit::Status(0));
        assert_eq!(
            harness.lines(),
            vec![line("received TERM, attempting graceful shutdown")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_quit_also_retires() {
        let (mode, harness) = start(sleeper(10)).await.unwrap();
        harness
            .signals
            .send(LifecycleEvent::Shutdown(Signal::SIGQUIT))
            .unwrap();
        assert_eq!(mode.run_until_exit().await, WorkerExit::Status(0));
        assert_eq!(
            harness.lines(),
            vec![line("received QUIT, attempting graceful shutdown")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_exits_without_drain() {
        let (mode, harness) = start(sleeper(10_000)).await.unwrap();
        harness.signals.send(LifecycleEvent::Interrupt).unwrap();
        assert_eq!(mode.run_until_exit().await, WorkerExit::Interrupted);
        assert_eq!(
            harness.lines(),
            vec![line("received INT, immediately shutting down")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_during_retirement_still_exits_immediately() {
        let (mode, harness) = start(sleeper(10_000)).await.unwrap();
        harness.term();
        harness.signals.send(LifecycleEvent::Interrupt).unwrap();
        assert_eq!(mode.run_until_exit().await, WorkerExit::Interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_task_ends_worker_with_its_code() {
        let (mode, _harness) = start(|ctx: &WorkerContext| {
            ctx.spawn(async {
                sleep(Duration::from_millis(10)).await;
                Err(DroverError::Exit(3))
            });
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(mode.run_until_exit().await, WorkerExit::Status(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_during_retirement_becomes_natural_status() {
        let (mode, harness) = start(|ctx: &WorkerContext| {
            let token = ctx.retirement_token();
            ctx.spawn(async move {
                token.cancelled().await;
                Err(DroverError::Exit(4))
            });
            Ok(())
        })
        .await
        .unwrap();
        harness.term();
        assert_eq!(mode.run_until_exit().await, WorkerExit::Status(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_can_stop_early_on_retirement() {
        let (mode, harness) = start(|ctx: &WorkerContext| {
            let worker = ctx.clone();
            ctx.spawn(async move {
                tokio::select! {
                    _ = worker.retired() => Ok(()),
                    _ = sleep(Duration::from_secs(60)) => Err(DroverError::Exit(9)),
                }
            });
            Ok(())
        })
        .await
        .unwrap();
        harness.term();
        let started = Instant::now();
        assert_eq!(mode.run_until_exit().await, WorkerExit::Status(0));
        assert!(started.elapsed() < TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_going_away_ends_worker() {
        let (mode, mut harness) = start(sleeper(10_000)).await.unwrap();
        harness.parent.take();
        assert_eq!(mode.run_until_exit().await, WorkerExit::Status(1));
        assert_eq!(
            harness.lines(),
            vec![line("supervisor disconnected, exiting")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_stays_alive_until_retired() {
        let (mode, harness) = start(sleeper(10)).await.unwrap();
        let signals = harness.signals.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(30)).await;
            signals
                .send(LifecycleEvent::Shutdown(Signal::SIGTERM))
                .unwrap();
        });
        let started = Instant::now();
        assert_eq!(mode.run_until_exit().await, WorkerExit::Status(0));
        assert!(started.elapsed() >= Duration::from_secs(30));
    }
}
