use crate::{
    cluster::{lifecycle_event::WorkerId, worker_context::WorkerContext},
    env,
    options::Options,
};
use drover_error::Result;
use supervisor_mode::SupervisorMode;

pub mod supervisor_mode;
pub mod worker_mode;

/// Which side of the pool this process plays, decided by the environment the
/// supervisor sets on the processes it starts.
pub(crate) enum ServeStrategy<F> {
    Supervisor(Options),
    Worker(WorkerId, F, Options),
}

impl<F> ServeStrategy<F>
where
    F: Fn(&WorkerContext) -> Result<()>,
{
    pub fn build(work: F, options: Options) -> Result<Self> {
        options.validate()?;
        Ok(match env::worker_id()? {
            Some(worker_id) => ServeStrategy::Worker(worker_id, work, options),
            None => ServeStrategy::Supervisor(options),
        })
    }

    pub fn run(self) -> Result<()> {
        match self {
            ServeStrategy::Supervisor(options) => {
                let (supervisor, events_rx) = SupervisorMode::new(options);
                supervisor.run(events_rx)
            }
            ServeStrategy::Worker(worker_id, work, options) => {
                worker_mode::run(worker_id, work, options)
            }
        }
    }
}
