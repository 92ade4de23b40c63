use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by [`crate::ConcurrentWorkerSet`] operations.
///
/// The type is `Clone` because a single failure (a worker that never came up,
/// a teardown) may have to reject several waiters at once.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("ConcurrentWorkerSet already started")]
    AlreadyStarted,

    #[error("ConcurrentWorkerSet stopped")]
    NotStarted,

    #[error("ConcurrentWorkerSet has no workers")]
    NoWorkers,

    #[error("Failed to launch worker: {0}")]
    LaunchFailure(String),

    #[error("Timeout exceeded when waiting for first message from worker ({0:?})")]
    InitializationTimeout(Duration),

    #[error("Request aborted")]
    Aborted,

    #[error("{message}")]
    Remote {
        message: String,
        stack: Option<String>,
    },

    #[error("ConcurrentWorkerSet destroyed")]
    Destroyed,

    #[error("Worker {0} exited with requests in flight")]
    WorkerExited(usize),
}

impl PoolError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, PoolError::Aborted)
    }

    /// Remote stack trace attached to a worker-reported error, if any.
    pub fn remote_stack(&self) -> Option<&str> {
        match self {
            PoolError::Remote { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }
}
