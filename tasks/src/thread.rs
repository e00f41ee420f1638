//! Running a single long task on a dedicated thread

use crate::error::{SubmitError, TaskError};
use crate::executor::run_task;
use crate::future::TaskFuture;
use std::thread::{self, JoinHandle};

/// Run `task` on a new thread named `name`, settling `future` with its outcome.
///
/// The future is created by the caller so that a cancellation hook and time
/// estimates can be installed before the task gets a chance to start.
pub fn execute_task<T, F>(
    name: &str,
    future: &TaskFuture<T>,
    task: F,
) -> Result<JoinHandle<()>, SubmitError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, TaskError> + Send + 'static,
{
    let worker_future = future.clone();
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || run_task(&worker_future, task))?;
    tracing::debug!("Task {} started on thread '{}'", future.id(), name);
    Ok(handle)
}
