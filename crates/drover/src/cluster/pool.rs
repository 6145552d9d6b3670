//! Supervisor state machine.
//!
//! `Pool` owns every worker record and the shutdown latch. It never touches
//! processes itself: each transition logs to the event stream and returns the
//! [`Command`]s the supervisor loop must carry out.

use super::lifecycle_event::{
    short_name, ClusterEvent, LifecycleEvent, TerminationReason, WorkerId,
};
use drover_tracing::EventLogger;
use nix::{sys::signal::Signal, unistd::Pid};
use rand::seq::IndexedRandom;
use std::collections::BTreeMap;
use drover_tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
    pub(crate) id: WorkerId,
    pub(crate) pid: Option<Pid>,
    /// Set once the supervisor has decided to retire this worker. A worker
    /// going away with this unset is a crash.
    pub(crate) intentional: bool,
    pub(crate) online: bool,
    pub(crate) disconnected: bool,
}

impl WorkerRecord {
    fn new(id: WorkerId) -> Self {
        Self {
            id,
            pid: None,
            intentional: false,
            online: false,
            disconnected: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Latch {
    Idle,
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start a worker process for a record the pool has already added.
    Fork(WorkerId),
    /// Send the retirement signal to one worker.
    Retire(WorkerId, Pid),
    /// Restore the default INT disposition and re-raise it.
    Interrupt,
    /// Start the force-kill backstop for a graceful shutdown.
    ArmShutdownDeadline,
}

pub struct Pool {
    target: usize,
    workers: BTreeMap<WorkerId, WorkerRecord>,
    latch: Latch,
    next_worker_id: usize,
    forks_requested: usize,
    logger: EventLogger,
}

impl Pool {
    pub fn new(logger: EventLogger) -> Self {
        Self {
            target: 0,
            workers: BTreeMap::new(),
            latch: Latch::Idle,
            next_worker_id: 1,
            forks_requested: 0,
            logger,
        }
    }

    /// Requests `workers` forks. Runs before any signal is processed.
    pub fn start(&mut self, workers: usize) -> Vec<Command> {
        self.target = workers;
        (0..workers).map(|_| self.request_fork()).collect()
    }

    fn request_fork(&mut self) -> Command {
        let id = WorkerId(self.next_worker_id);
        self.next_worker_id += 1;
        self.forks_requested += 1;
        self.workers.insert(id, WorkerRecord::new(id));
        Command::Fork(id)
    }

    /// Records the pid of a worker whose process has been started.
    pub fn worker_started(&mut self, id: WorkerId, pid: Pid) {
        if let Some(record) = self.workers.get_mut(&id) {
            record.pid = Some(pid);
        }
    }

    /// Drops the record of a fork that never produced a process.
    pub fn worker_failed_to_start(&mut self, id: WorkerId) {
        if self.workers.remove(&id).is_some() {
            self.logger.event(format!("worker {} failed to start", id));
            self.log_if_drained();
        }
    }

    pub fn on_cluster_event(&mut self, event: ClusterEvent) -> Vec<Command> {
        match event {
            ClusterEvent::Online(id) => {
                self.worker_online(id);
                vec![]
            }
            ClusterEvent::Disconnected(id) => self.worker_disconnected(id),
            ClusterEvent::Exited(id, reason) => self.worker_exited(id, reason),
        }
    }

    pub fn on_lifecycle_event(&mut self, event: LifecycleEvent) -> Vec<Command> {
        match event {
            LifecycleEvent::Interrupt => {
                self.logger.event("received INT, immediately shutting down");
                vec![Command::Interrupt]
            }
            LifecycleEvent::Shutdown(signal) => self.shutdown(signal),
            LifecycleEvent::IncreaseWorkers => self.increase_workers(),
            LifecycleEvent::DecreaseWorkers => self.decrease_workers(),
        }
    }

    fn worker_online(&mut self, id: WorkerId) {
        if let Some(record) = self.workers.get_mut(&id) {
            record.online = true;
        }
        self.logger.event(format!("worker {} online", id));
    }

    fn worker_disconnected(&mut self, id: WorkerId) -> Vec<Command> {
        let Some(record) = self.workers.get_mut(&id) else {
            debug!("Ignoring disconnect of unknown worker {}", id);
            return vec![];
        };
        if record.disconnected {
            return vec![];
        }
        record.disconnected = true;
        let intentional = record.intentional;
        self.logger.event(format!("worker {} disconnected", id));

        if intentional {
            vec![]
        } else {
            vec![self.request_fork()]
        }
    }

    fn worker_exited(&mut self, id: WorkerId, reason: TerminationReason) -> Vec<Command> {
        let Some(record) = self.workers.get(&id) else {
            debug!("Ignoring exit of unknown worker {}", id);
            return vec![];
        };
        let (intentional, online) = (record.intentional, record.online);
        // The exit can be reaped before the channel EOF is read.
        let commands = if record.disconnected {
            vec![]
        } else {
            self.worker_disconnected(id)
        };
        self.workers.remove(&id);
        if intentional {
            info!("Worker {} {}", id, reason);
        } else if online {
            warn!("Worker {} {} unexpectedly", id, reason);
        } else {
            warn!("Worker {} {} before coming online", id, reason);
        }
        self.logger.event(format!("worker {} exited", id));
        self.log_if_drained();
        commands
    }

    fn log_if_drained(&self) {
        if self.workers.is_empty() {
            self.logger.event("all workers exited");
        }
    }

    fn shutdown(&mut self, signal: Signal) -> Vec<Command> {
        let name = short_name(signal);
        if self.latch == Latch::ShuttingDown {
            self.logger
                .event(format!("ignoring {}, already shutting down", name));
            return vec![];
        }
        self.latch = Latch::ShuttingDown;
        self.logger
            .event(format!("received {}, attempting graceful shutdown", name));

        let mut commands: Vec<Command> = self
            .workers
            .values_mut()
            .filter_map(|record| {
                record.intentional = true;
                record.pid.map(|pid| Command::Retire(record.id, pid))
            })
            .collect();
        commands.push(Command::ArmShutdownDeadline);
        commands
    }

    fn increase_workers(&mut self) -> Vec<Command> {
        if self.latch == Latch::ShuttingDown {
            self.logger.event("ignoring TTIN, am shutting down");
            return vec![];
        }
        self.logger.event("received TTIN, forking additional worker");
        self.target += 1;
        vec![self.request_fork()]
    }

    fn decrease_workers(&mut self) -> Vec<Command> {
        if self.latch == Latch::ShuttingDown {
            self.logger.event("ignoring TTOU, am shutting down");
            return vec![];
        }
        let candidates: Vec<(WorkerId, Pid)> = self
            .workers
            .values()
            .filter(|record| !record.intentional)
            .filter_map(|record| record.pid.map(|pid| (record.id, pid)))
            .collect();
        let Some(&(id, pid)) = candidates.choose(&mut rand::rng()) else {
            self.logger.event("ignoring TTOU, all workers disconnected");
            return vec![];
        };
        self.logger.event("received TTOU, disconnecting a worker");
        self.target = self.target.saturating_sub(1);
        if let Some(record) = self.workers.get_mut(&id) {
            record.intentional = true;
        }
        vec![Command::Retire(id, pid)]
    }

    #[cfg(test)]
    pub(crate) fn latch(&self) -> Latch {
        self.latch
    }

    pub fn is_shutting_down(&self) -> bool {
        self.latch == Latch::ShuttingDown
    }

    /// Shutting down with nothing left to wait for.
    pub fn is_finished(&self) -> bool {
        self.is_shutting_down() && self.workers.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        self.workers.len()
    }

    #[cfg(test)]
    pub(crate) fn target(&self) -> usize {
        self.target
    }

    pub fn forks_requested(&self) -> usize {
        self.forks_requested
    }

    #[cfg(test)]
    pub(crate) fn get(&self, id: WorkerId) -> Option<&WorkerRecord> {
        self.workers.get(&id)
    }

    #[cfg(test)]
    pub(crate) fn records(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }
}
