//! Cancellable, progress-reporting futures and the executors that run them
//!
//! This crate provides:
//! - `TaskFuture`: a single-assignment result cell with done callbacks, an
//!   optional cancellation hook for running tasks and start/end estimates
//! - `Executor`: a bounded worker pool whose bulk `cancel()` sweeps every
//!   task it has not started yet
//! - `execute_task`: runs one long task on its own named thread

pub mod error;
pub mod executor;
pub mod future;
pub mod progress;
pub mod thread;

pub use error::{SubmitError, TaskError};
pub use executor::{Executor, ExecutorConfig};
pub use future::{Cancellable, CancellationHook, TaskFuture, TaskId, TaskState};
pub use progress::{ProgressReporting, TaskProgress, NOT_STARTED_ELAPSED};
pub use thread::execute_task;
