//! Error types for task futures and executors
//!
//! Two families of errors exist and they never mix:
//! - `TaskError` is what a future hands back from `result()`. It is stored on
//!   the future and cloned out on every call.
//! - `SubmitError` is raised synchronously by `Executor::submit` and friends.
//!   It is never stored on a future since no future is created.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error reported by `TaskFuture::result`
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    /// The task was cancelled before it could produce a value
    #[error("Task cancelled")]
    Cancelled,

    /// `result()` gave up waiting; the task itself is unaffected
    #[error("Task result not available after {0:?}")]
    Timeout(Duration),

    /// The task body returned an error
    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),

    /// The task body panicked; the worker caught it
    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Wrap any error as the stored failure of a task
    pub fn failed<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        TaskError::Failed(Arc::new(error.into()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout(_))
    }

    /// Look through a stored failure for a specific error type.
    ///
    /// Context added with `anyhow::Context` is transparent here.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            TaskError::Failed(error) => error.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(error: anyhow::Error) -> Self {
        TaskError::Failed(Arc::new(error))
    }
}

/// Error raised when work cannot be scheduled
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Cannot schedule new tasks after shutdown")]
    Shutdown,

    #[error("Failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Failed to spawn task thread: {0}")]
    Spawn(#[from] std::io::Error),
}
