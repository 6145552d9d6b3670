pub mod channel;
pub mod lifecycle_event;
pub mod pool;
pub mod process_worker;
pub mod serve_strategy;
pub mod signal;
pub mod worker_context;
