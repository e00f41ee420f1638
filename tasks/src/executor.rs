//! Bounded worker pool handing out task futures
//!
//! The executor keeps every future it handed out in an ordered
//! "outstanding" set until that future settles, so that `cancel()` can sweep
//! everything that is still queued. The sweep starts from the most recently
//! submitted task, the most likely to still be pending and thus cheap to
//! cancel.

use crate::error::{SubmitError, TaskError};
use crate::future::{panic_message, CancellationHook, Cancellable, TaskFuture, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Configuration for an executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Number of worker threads
    pub max_workers: usize,
    /// Prefix of the worker thread names
    pub thread_name: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            thread_name: "calibscan-worker".to_string(),
        }
    }
}

/// Futures handed out and not settled yet, oldest first
#[derive(Default)]
struct Outstanding {
    queue: Mutex<VecDeque<Arc<dyn Cancellable>>>,
}

impl Outstanding {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<dyn Cancellable>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, future: Arc<dyn Cancellable>) {
        self.lock().push_back(future);
    }

    /// Idempotent: a future already popped by a sweep is simply not found
    fn remove(&self, id: TaskId) {
        let mut queue = self.lock();
        if let Some(pos) = queue.iter().position(|f| f.id() == id) {
            queue.remove(pos);
        }
    }

    fn pop_latest(&self) -> Option<Arc<dyn Cancellable>> {
        self.lock().pop_back()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Cancellable>> {
        self.lock().iter().cloned().collect()
    }
}

/// Options applied to a future before its task is queued
#[derive(Default)]
struct TaskOptions {
    hook: Option<CancellationHook>,
    expected: Option<Duration>,
}

/// A worker pool that can cancel all the tasks not yet started
pub struct Executor {
    pool: rayon::ThreadPool,
    outstanding: Arc<Outstanding>,
    shutdown: Mutex<bool>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Result<Self, SubmitError> {
        let prefix = config.thread_name.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_workers.max(1))
            .thread_name(move |i| format!("{}-{}", prefix, i))
            .build()?;

        tracing::debug!(
            "Started executor '{}' with {} worker(s)",
            config.thread_name,
            config.max_workers.max(1)
        );

        Ok(Self {
            pool,
            outstanding: Arc::new(Outstanding::default()),
            shutdown: Mutex::new(false),
            config,
        })
    }

    pub fn with_workers(max_workers: usize) -> Result<Self, SubmitError> {
        Self::new(ExecutorConfig {
            max_workers,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Queue `task` and return its future
    pub fn submit<T, F>(&self, task: F) -> Result<TaskFuture<T>, SubmitError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    {
        self.enqueue(TaskOptions::default(), task)
    }

    /// Queue `task` with a hook able to abort it while it runs
    pub fn submit_cancellable<T, F>(
        &self,
        task: F,
        hook: CancellationHook,
    ) -> Result<TaskFuture<T>, SubmitError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    {
        self.enqueue(
            TaskOptions {
                hook: Some(hook),
                ..Default::default()
            },
            task,
        )
    }

    /// Queue `task`, announcing how long it is expected to run
    pub fn submit_progressive<T, F>(
        &self,
        expected: Duration,
        task: F,
    ) -> Result<TaskFuture<T>, SubmitError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    {
        self.enqueue(
            TaskOptions {
                expected: Some(expected),
                ..Default::default()
            },
            task,
        )
    }

    fn enqueue<T, F>(&self, options: TaskOptions, task: F) -> Result<TaskFuture<T>, SubmitError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    {
        let shutdown = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
        if *shutdown {
            return Err(SubmitError::Shutdown);
        }

        let future = TaskFuture::new();
        if let Some(hook) = options.hook {
            future.set_cancellation_hook(hook);
        }
        if let Some(expected) = options.expected {
            future.set_expected_duration(expected);
        }
        tracing::debug!("Queuing task {} on '{}'", future.id(), self.config.thread_name);

        // Track the task until it is over
        self.outstanding.push(Arc::new(future.clone()));
        let outstanding = self.outstanding.clone();
        future.on_settled(move |id| outstanding.remove(id));

        let worker_future = future.clone();
        self.pool.spawn(move || run_task(&worker_future, task));
        drop(shutdown);

        Ok(future)
    }

    /// Number of futures handed out and not settled yet
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel all the tasks still queued.
    ///
    /// Returns once every task submitted so far is either cancelled or over.
    /// Errors of the tasks that could not be cancelled are ignored.
    pub fn cancel(&self) {
        tracing::debug!(
            "Cancelling all the {} futures in queue",
            self.outstanding.len()
        );

        let mut uncancellables = Vec::new();
        while let Some(future) = self.outstanding.pop_latest() {
            if !future.cancel() {
                uncancellables.push(future);
            }
        }

        for future in uncancellables {
            tracing::debug!("Waiting for uncancellable task {}", future.id());
            future.wait(None);
        }
    }

    /// Stop accepting new tasks, optionally waiting for the queued ones
    pub fn shutdown(&self, wait: bool) {
        *self.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = true;
        tracing::debug!("Executor '{}' shut down", self.config.thread_name);
        if wait {
            for future in self.outstanding.snapshot() {
                future.wait(None);
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}

/// Run `task` on the calling thread and settle `future` with its outcome.
///
/// Nothing runs if the future was cancelled in the meantime. A panicking
/// body is stored as `TaskError::Panicked`.
pub(crate) fn run_task<T, F>(future: &TaskFuture<T>, task: F)
where
    F: FnOnce() -> Result<T, TaskError>,
{
    if !future.set_running_or_notify_cancel() {
        return;
    }

    let outcome = match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            tracing::error!("Task {} panicked: {}", future.id(), msg);
            Err(TaskError::Panicked(msg))
        }
    };
    if let Err(err) = &outcome {
        if !err.is_cancelled() {
            tracing::debug!("Task {} failed: {}", future.id(), err);
        }
    }
    future.set_outcome(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::TaskState;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_submit_and_result() {
        let executor = Executor::with_workers(2).unwrap();
        let future = executor.submit(|| Ok(6 * 7)).unwrap();
        assert_eq!(future.result(Some(Duration::from_secs(5))).unwrap(), 42);
    }

    #[test]
    fn test_task_error_is_stored() {
        let executor = Executor::with_workers(1).unwrap();
        let future = executor
            .submit::<u32, _>(|| Err(TaskError::failed(anyhow::anyhow!("no signal"))))
            .unwrap();
        let err = future.result(Some(Duration::from_secs(5))).unwrap_err();
        assert_eq!(err.to_string(), "no signal");
        assert_eq!(future.state(), TaskState::Finished);
    }

    #[test]
    fn test_panic_does_not_kill_worker() {
        let executor = Executor::with_workers(1).unwrap();
        let bad = executor.submit::<u32, _>(|| panic!("driver crashed")).unwrap();
        let good = executor.submit(|| Ok(1)).unwrap();

        match bad.result(Some(Duration::from_secs(5))) {
            Err(TaskError::Panicked(msg)) => assert!(msg.contains("driver crashed")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(good.result(Some(Duration::from_secs(5))).unwrap(), 1);
    }

    #[test]
    fn test_outstanding_tracks_unfinished_tasks() {
        let executor = Executor::with_workers(1).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let blocker = executor
            .submit(move || {
                release_rx.recv().ok();
                Ok(())
            })
            .unwrap();
        let queued = executor.submit(|| Ok(2)).unwrap();
        assert_eq!(executor.outstanding(), 2);

        release_tx.send(()).unwrap();
        blocker.result(Some(Duration::from_secs(5))).unwrap();
        queued.result(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(executor.outstanding(), 0);
    }

    #[test]
    fn test_settled_task_leaves_outstanding_before_result_returns() {
        let executor = Executor::with_workers(2).unwrap();
        for i in 0..500 {
            let future = executor.submit(move || Ok(i)).unwrap();
            assert_eq!(future.result(Some(Duration::from_secs(5))).unwrap(), i);
            assert_eq!(executor.outstanding(), 0, "iteration {}", i);
        }
    }

    #[test]
    fn test_cancelled_task_leaves_outstanding_before_cancel_returns() {
        let executor = Executor::with_workers(1).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let blocker = executor
            .submit(move || {
                release_rx.recv().ok();
                Ok(())
            })
            .unwrap();
        let queued = executor.submit(|| Ok(1)).unwrap();
        assert_eq!(executor.outstanding(), 2);

        assert!(queued.cancel());
        assert_eq!(executor.outstanding(), 1);

        release_tx.send(()).unwrap();
        blocker.result(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(executor.outstanding(), 0);
    }

    #[test]
    fn test_bulk_cancel_leaves_nothing_running() {
        let executor = Executor::with_workers(2).unwrap();
        let completed = Arc::new(AtomicUsize::new(0));
        let futures: Vec<_> = (0..10)
            .map(|i| {
                let completed = completed.clone();
                executor
                    .submit(move || {
                        thread::sleep(Duration::from_millis(100));
                        completed.fetch_add(1, Ordering::SeqCst);
                        Ok(i)
                    })
                    .unwrap()
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        executor.cancel();

        assert!(completed.load(Ordering::SeqCst) <= 2);
        assert!(futures.iter().all(|f| f.done()));
        let cancelled = futures
            .iter()
            .filter(|f| matches!(f.result(Some(Duration::ZERO)), Err(TaskError::Cancelled)))
            .count();
        assert!(cancelled >= 8, "only {} tasks cancelled", cancelled);
        assert_eq!(executor.outstanding(), 0);

        // Give the pool time to drain the cancelled work items
        thread::sleep(Duration::from_millis(150));
        assert!(completed.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_bulk_cancel_swallows_errors() {
        let executor = Executor::with_workers(1).unwrap();
        let failing = executor
            .submit::<u32, _>(|| {
                thread::sleep(Duration::from_millis(30));
                Err(TaskError::failed(anyhow::anyhow!("overheated")))
            })
            .unwrap();
        thread::sleep(Duration::from_millis(5));
        executor.cancel();
        assert!(failing.done());
        assert!(failing.result(None).is_err());
    }

    #[test]
    fn test_bulk_cancel_uses_hooks() {
        let executor = Executor::with_workers(1).unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let body_stop = stop.clone();
        let hook_stop = stop.clone();
        let future = executor
            .submit_cancellable(
                move || {
                    while !body_stop.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Err::<(), _>(TaskError::Cancelled)
                },
                Arc::new(move || {
                    hook_stop.store(true, Ordering::SeqCst);
                    true
                }),
            )
            .unwrap();

        while !future.running() {
            thread::sleep(Duration::from_millis(1));
        }
        executor.cancel();
        assert!(future.cancelled());
        assert!(stop.load(Ordering::SeqCst));
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let executor = Executor::with_workers(1).unwrap();
        executor.shutdown(false);
        assert!(executor.is_shutdown());
        let err = executor.submit(|| Ok(1)).unwrap_err();
        assert!(matches!(err, SubmitError::Shutdown));
        assert_eq!(executor.outstanding(), 0);
    }

    #[test]
    fn test_shutdown_waits_for_queued_work() {
        let executor = Executor::with_workers(1).unwrap();
        let futures: Vec<_> = (0..3)
            .map(|i| {
                executor
                    .submit(move || {
                        thread::sleep(Duration::from_millis(10));
                        Ok(i)
                    })
                    .unwrap()
            })
            .collect();
        executor.shutdown(true);
        assert!(futures.iter().all(|f| f.done()));
    }

    #[test]
    fn test_progressive_submission_sets_end_estimate() {
        let executor = Executor::with_workers(1).unwrap();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let future = executor
            .submit_progressive(Duration::from_secs(20), move || {
                started_tx.send(()).ok();
                release_rx.recv().ok();
                Ok(())
            })
            .unwrap();

        started_rx.recv().unwrap();
        let progress = future.progress();
        assert!(progress.remaining > 19.0 && progress.remaining <= 20.0);

        release_tx.send(()).unwrap();
        future.result(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(future.progress().remaining, 0.0);
    }

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: ExecutorConfig = serde_json::from_str(r#"{"max_workers": 4}"#).unwrap();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.thread_name, "calibscan-worker");
    }
}
