pub mod from;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DroverError>;

/// Status a worker exits with when it fails without a code of its own,
/// and when its graceful shutdown window runs out.
pub const FAILURE_EXIT_CODE: i32 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DroverError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to start worker {0}: {1}")]
    Spawn(usize, String),
    #[error("Failed to signal process {0}: {1}")]
    Signal(i32, String),
    #[error("Lifecycle channel error: {0}")]
    Channel(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("OS error: {0}")]
    Os(String),
    #[error("Work failed: {0}")]
    Work(String),
    #[error("Exit with status {0}")]
    Exit(i32),
}

impl DroverError {
    pub fn work(error: impl std::fmt::Display) -> Self {
        DroverError::Work(format!("{}", error))
    }

    /// Process status a worker should end with when this error stops it.
    pub fn exit_code(&self) -> i32 {
        match self {
            DroverError::Exit(code) => *code,
            _ => FAILURE_EXIT_CODE,
        }
    }
}
