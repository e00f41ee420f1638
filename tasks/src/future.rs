//! Single-assignment task futures
//!
//! A `TaskFuture` is a cheap, cloneable handle on a shared result cell. The
//! cell carries a small state machine:
//!
//! ```text
//! Pending ──► Running ──► Finished
//!    │           │
//!    └──► Cancelled ◄┘
//!            │
//!            ▼
//!     CancelledNotified
//! ```
//!
//! All transitions happen under the cell's mutex. Callbacks are snapshotted
//! under the mutex and invoked after it has been released, so a callback may
//! call back into the same future without deadlocking.
//!
//! Cancelling a running task is only possible through a cancellation hook,
//! installed with [`TaskFuture::set_cancellation_hook`]. The hook is invoked
//! synchronously from `cancel()` and reports whether it actually aborted the
//! in-flight work.

use crate::error::TaskError;
use crate::progress::{ProgressTimes, TaskProgress, UpdateCallback};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// Identifier of a task, used in logs and by executors
pub type TaskId = Uuid;

/// Hook invoked by `cancel()` while the task is running.
///
/// Returns true if the in-flight work was aborted.
pub type CancellationHook = Arc<dyn Fn() -> bool + Send + Sync>;

type DoneCallback<T> = Box<dyn FnOnce(&TaskFuture<T>) + Send>;

/// Bookkeeping run under the lock when the task becomes terminal
type SettleHook = Box<dyn FnOnce(TaskId) + Send>;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Running,
    Cancelled,
    /// Cancelled, and the worker that would have run it has noticed
    CancelledNotified,
    Finished,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Cancelled | TaskState::CancelledNotified | TaskState::Finished
        )
    }

    pub fn is_cancelled(self) -> bool {
        matches!(self, TaskState::Cancelled | TaskState::CancelledNotified)
    }
}

/// Capability shared by every future regardless of its value type.
///
/// Executors and scanners keep type-erased handles on the work they own
/// through this trait.
pub trait Cancellable: Send + Sync {
    fn id(&self) -> TaskId;

    /// Attempt to cancel; true if the task is (now) cancelled
    fn cancel(&self) -> bool;

    fn done(&self) -> bool;

    /// Block until the task is terminal or the timeout elapses.
    ///
    /// Returns whether the task is terminal. Task errors are not reported.
    fn wait(&self, timeout: Option<Duration>) -> bool;
}

pub(crate) struct Slot<T> {
    pub(crate) state: TaskState,
    outcome: Option<Result<T, TaskError>>,
    done_callbacks: Vec<DoneCallback<T>>,
    pub(crate) update_callbacks: Vec<UpdateCallback>,
    hook: Option<CancellationHook>,
    settle_hooks: Vec<SettleHook>,
    pub(crate) times: ProgressTimes,
}

struct Shared<T> {
    id: TaskId,
    slot: Mutex<Slot<T>>,
    changed: Condvar,
}

/// Handle on the eventual outcome of a task
pub struct TaskFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFuture")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl<T> Default for TaskFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskFuture<T> {
    /// A pending future with a start/end estimate slightly in the future
    pub fn new() -> Self {
        Self::with_times(ProgressTimes::estimated(Utc::now()))
    }

    /// A pending future with explicit start and end estimates
    pub fn progressive(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self::with_times(ProgressTimes::new(start, end))
    }

    /// A future that is already finished with `value`
    pub fn finished(value: T) -> Self {
        Self::settled(Ok(value))
    }

    /// A future that is already finished with `error`
    pub fn failed(error: TaskError) -> Self {
        Self::settled(Err(error))
    }

    fn settled(outcome: Result<T, TaskError>) -> Self {
        let future = Self::with_times(ProgressTimes::instant(Utc::now()));
        {
            let mut slot = future.lock();
            slot.state = TaskState::Finished;
            slot.outcome = Some(outcome);
        }
        future
    }

    fn with_times(times: ProgressTimes) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                slot: Mutex::new(Slot {
                    state: TaskState::Pending,
                    outcome: None,
                    done_callbacks: Vec::new(),
                    update_callbacks: Vec::new(),
                    hook: None,
                    settle_hooks: Vec::new(),
                    times,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        // User callbacks and hooks never run under this lock, so a poisoned
        // cell still holds a consistent state.
        self.shared.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn state(&self) -> TaskState {
        self.lock().state
    }

    pub fn done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn cancelled(&self) -> bool {
        self.state().is_cancelled()
    }

    pub fn running(&self) -> bool {
        self.state() == TaskState::Running
    }

    /// Install the hook used to abort the task while it is running
    pub fn set_cancellation_hook(&self, hook: CancellationHook) {
        self.lock().hook = Some(hook);
    }

    pub fn clear_cancellation_hook(&self) {
        self.lock().hook = None;
    }

    /// Cancel the task if possible.
    ///
    /// Returns true if the task is cancelled once this call returns. A
    /// finished task cannot be cancelled. A running task is only cancelled
    /// if its hook reports that the in-flight work was aborted.
    pub fn cancel(&self) -> bool {
        let mut slot = self.lock();
        match slot.state {
            TaskState::Finished => return false,
            TaskState::Cancelled | TaskState::CancelledNotified => return true,
            TaskState::Pending => {}
            TaskState::Running => {
                let Some(hook) = slot.hook.clone() else {
                    tracing::debug!("Task {} is running and cannot be cancelled", self.id());
                    return false;
                };
                drop(slot);

                let aborted = match panic::catch_unwind(AssertUnwindSafe(|| hook())) {
                    Ok(aborted) => aborted,
                    Err(payload) => {
                        tracing::error!(
                            "Cancellation hook of task {} panicked: {}",
                            self.id(),
                            panic_message(payload.as_ref())
                        );
                        false
                    }
                };
                if !aborted {
                    tracing::debug!("Cancellation hook of task {} refused", self.id());
                    return false;
                }

                slot = self.lock();
                match slot.state {
                    // Completed while the hook was running
                    TaskState::Finished => return false,
                    TaskState::Cancelled | TaskState::CancelledNotified => return true,
                    TaskState::Pending | TaskState::Running => {}
                }
            }
        }

        tracing::debug!("Task {} cancelled", self.id());
        slot.state = TaskState::Cancelled;
        self.settle(slot);
        true
    }

    /// Block until the task reaches a terminal state and return its outcome.
    ///
    /// On timeout the task is left untouched and may still complete later.
    pub fn result(&self, timeout: Option<Duration>) -> Result<T, TaskError>
    where
        T: Clone,
    {
        let slot = self.wait_terminal(timeout)?;
        match &slot.outcome {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(error)) => Err(error.clone()),
            None => Err(TaskError::Cancelled),
        }
    }

    /// Await the outcome from an async context without blocking the runtime.
    pub async fn wait_async(&self) -> Result<T, TaskError>
    where
        T: Clone,
    {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        self.add_done_callback(move |_| {
            let _ = tx.send(());
        });
        // The sender lives in the callback list until the task settles
        let _ = rx.await;
        self.result(Some(Duration::ZERO))
    }

    fn wait_terminal(
        &self,
        timeout: Option<Duration>,
    ) -> Result<MutexGuard<'_, Slot<T>>, TaskError> {
        let slot = self.lock();
        match timeout {
            None => Ok(self
                .shared
                .changed
                .wait_while(slot, |s| !s.state.is_terminal())
                .unwrap_or_else(PoisonError::into_inner)),
            Some(timeout) => {
                let (slot, _) = self
                    .shared
                    .changed
                    .wait_timeout_while(slot, timeout, |s| !s.state.is_terminal())
                    .unwrap_or_else(PoisonError::into_inner);
                if slot.state.is_terminal() {
                    Ok(slot)
                } else {
                    Err(TaskError::Timeout(timeout))
                }
            }
        }
    }

    /// Register `callback` to run once the task is terminal.
    ///
    /// If the task is already terminal the callback runs right away, before
    /// this call returns. Otherwise callbacks run in registration order, on
    /// the thread that settles the task.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&TaskFuture<T>) + Send + 'static,
    {
        {
            let mut slot = self.lock();
            if !slot.state.is_terminal() {
                slot.done_callbacks.push(Box::new(callback));
                return;
            }
        }
        self.invoke_done(Box::new(callback));
    }

    /// Register executor bookkeeping to run as the task becomes terminal.
    ///
    /// Unlike done callbacks, these run under the cell's lock, before any
    /// waiter is woken up, so they must be short and must not touch the
    /// future. Runs right away if the task is already terminal.
    pub(crate) fn on_settled<F>(&self, hook: F)
    where
        F: FnOnce(TaskId) + Send + 'static,
    {
        let mut slot = self.lock();
        if slot.state.is_terminal() {
            drop(slot);
            hook(self.id());
        } else {
            slot.settle_hooks.push(Box::new(hook));
        }
    }

    /// Mark the task as running, or acknowledge its cancellation.
    ///
    /// To be called once by the worker right before running the body. When
    /// this returns false the body must not be run.
    pub fn set_running_or_notify_cancel(&self) -> bool {
        let mut slot = self.lock();
        match slot.state {
            TaskState::Pending => {
                slot.state = TaskState::Running;
                slot.times.start(Utc::now());
                self.notify_updates(slot);
                true
            }
            TaskState::Cancelled => {
                tracing::debug!("Task {} was cancelled before it started", self.id());
                slot.state = TaskState::CancelledNotified;
                drop(slot);
                self.shared.changed.notify_all();
                false
            }
            state => {
                tracing::error!(
                    "Task {} cannot start, it is already {:?}",
                    self.id(),
                    state
                );
                false
            }
        }
    }

    /// Store the value produced by the task. To be used by executors only.
    pub fn set_result(&self, value: T) {
        self.set_outcome(Ok(value));
    }

    /// Store the error raised by the task. To be used by executors only.
    pub fn set_error(&self, error: TaskError) {
        self.set_outcome(Err(error));
    }

    pub(crate) fn set_outcome(&self, outcome: Result<T, TaskError>) {
        let mut slot = self.lock();
        match slot.state {
            // The body gave up after its hook aborted it
            TaskState::Running if matches!(outcome, Err(TaskError::Cancelled)) => {
                tracing::debug!("Task {} stopped on cancellation", self.id());
                slot.state = TaskState::Cancelled;
                self.settle(slot);
            }
            TaskState::Running => {
                slot.outcome = Some(outcome);
                slot.state = TaskState::Finished;
                self.settle(slot);
            }
            TaskState::Cancelled | TaskState::CancelledNotified => {
                tracing::debug!("Task {} was cancelled, dropping its outcome", self.id());
            }
            state => {
                tracing::warn!(
                    "Ignoring outcome of task {} in state {:?}",
                    self.id(),
                    state
                );
            }
        }
    }

    /// Finish a transition to a terminal state.
    ///
    /// Wakes up waiters, then reports progress one last time and runs the
    /// done callbacks, all with the lock released.
    fn settle(&self, mut slot: MutexGuard<'_, Slot<T>>) {
        // Bookkeeping must be over before any waiter can see the new state
        for hook in std::mem::take(&mut slot.settle_hooks) {
            hook(self.id());
        }

        let now = Utc::now();
        slot.times.stop(now);
        let progress = slot.times.progress(slot.state, now);
        let updates = slot.update_callbacks.clone();
        let callbacks = std::mem::take(&mut slot.done_callbacks);
        drop(slot);

        self.shared.changed.notify_all();
        for update in updates {
            self.invoke_update(&update, progress);
        }
        for callback in callbacks {
            self.invoke_done(callback);
        }
    }

    /// Release the lock and report the current progress to every subscriber
    pub(crate) fn notify_updates(&self, slot: MutexGuard<'_, Slot<T>>) {
        let progress = slot.times.progress(slot.state, Utc::now());
        let updates = slot.update_callbacks.clone();
        drop(slot);
        for update in updates {
            self.invoke_update(&update, progress);
        }
    }

    pub(crate) fn invoke_update(&self, update: &UpdateCallback, progress: TaskProgress) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| update(progress))) {
            tracing::error!(
                "Update callback of task {} panicked: {}",
                self.id(),
                panic_message(payload.as_ref())
            );
        }
    }

    fn invoke_done(&self, callback: DoneCallback<T>) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(self))) {
            tracing::error!(
                "Done callback of task {} panicked: {}",
                self.id(),
                panic_message(payload.as_ref())
            );
        }
    }
}

impl<T: Send + 'static> Cancellable for TaskFuture<T> {
    fn id(&self) -> TaskId {
        TaskFuture::id(self)
    }

    fn cancel(&self) -> bool {
        TaskFuture::cancel(self)
    }

    fn done(&self) -> bool {
        TaskFuture::done(self)
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        self.wait_terminal(timeout).is_ok()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    fn running<T>() -> TaskFuture<T> {
        let future = TaskFuture::new();
        assert!(future.set_running_or_notify_cancel());
        future
    }

    #[test]
    fn test_cancel_pending() {
        let future: TaskFuture<u32> = TaskFuture::new();
        assert_eq!(future.state(), TaskState::Pending);
        assert!(future.cancel());
        assert!(future.cancelled());
        assert!(future.done());
        assert!(matches!(future.result(None), Err(TaskError::Cancelled)));
        // The worker must not run it
        assert!(!future.set_running_or_notify_cancel());
        assert_eq!(future.state(), TaskState::CancelledNotified);
        assert!(future.cancel());
    }

    #[test]
    fn test_cancel_twice_runs_callbacks_once() {
        let future: TaskFuture<u32> = TaskFuture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        future.add_done_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(future.cancel());
        assert!(future.cancel());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_finished_is_refused() {
        let future = running();
        future.set_result(5);
        assert!(!future.cancel());
        assert_eq!(future.result(None).unwrap(), 5);
    }

    #[test]
    fn test_running_without_hook_cannot_be_cancelled() {
        let future = running::<u32>();
        assert!(!future.cancel());
        assert!(future.running());
        future.set_result(3);
        assert_eq!(future.result(None).unwrap(), 3);
    }

    #[test]
    fn test_cleared_hook_is_not_called() {
        let future = running::<u32>();
        let asked = Arc::new(AtomicBool::new(false));
        let flag = asked.clone();
        future.set_cancellation_hook(Arc::new(move || {
            flag.store(true, Ordering::SeqCst);
            true
        }));
        future.clear_cancellation_hook();

        assert!(!future.cancel());
        assert!(!asked.load(Ordering::SeqCst));
        assert!(future.running());
    }

    #[test]
    fn test_hook_refusal_lets_task_finish() {
        let future = running::<u32>();
        let asked = Arc::new(AtomicBool::new(false));
        let flag = asked.clone();
        future.set_cancellation_hook(Arc::new(move || {
            flag.store(true, Ordering::SeqCst);
            false
        }));

        assert!(!future.cancel());
        assert!(asked.load(Ordering::SeqCst));
        assert!(!future.done());

        future.set_result(42);
        assert_eq!(future.state(), TaskState::Finished);
        assert_eq!(future.result(None).unwrap(), 42);
    }

    #[test]
    fn test_hook_abort_cancels_running_task() {
        let future = running::<u32>();
        future.set_cancellation_hook(Arc::new(|| true));
        assert!(future.cancel());
        assert!(future.cancelled());

        // A late outcome from the aborted body is dropped
        future.set_result(1);
        assert!(matches!(future.result(None), Err(TaskError::Cancelled)));
    }

    #[test]
    fn test_hook_may_call_back_into_future() {
        let future = running::<u32>();
        let inner = future.clone();
        future.set_cancellation_hook(Arc::new(move || {
            // Would deadlock if the hook ran under the lock
            inner.state() == TaskState::Running
        }));
        assert!(future.cancel());
    }

    #[test]
    fn test_panicking_hook_counts_as_refusal() {
        let future = running::<u32>();
        future.set_cancellation_hook(Arc::new(|| panic!("hook exploded")));
        assert!(!future.cancel());
        assert!(future.running());
    }

    #[test]
    fn test_done_callback_on_finished_runs_immediately() {
        let future = TaskFuture::finished("ok");
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        future.add_done_callback(move |f| {
            assert!(f.done());
            flag.store(true, Ordering::SeqCst);
        });
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_done_callbacks_run_in_order() {
        let future = running::<u32>();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            future.add_done_callback(move |_| order.lock().unwrap().push(i));
        }
        future.set_result(0);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_done_callback_may_reenter() {
        let future = running::<u32>();
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        future.add_done_callback(move |f| {
            *slot.lock().unwrap() = Some(f.result(None).unwrap());
        });
        future.set_result(9);
        assert_eq!(*seen.lock().unwrap(), Some(9));
    }

    #[test]
    fn test_panicking_callback_does_not_affect_others() {
        let future = running::<u32>();
        let called = Arc::new(AtomicBool::new(false));
        future.add_done_callback(|_| panic!("callback exploded"));
        let flag = called.clone();
        future.add_done_callback(move |_| flag.store(true, Ordering::SeqCst));
        future.set_result(1);
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(future.result(None).unwrap(), 1);
    }

    #[test]
    fn test_result_timeout_leaves_task_alone() {
        let future = running::<u32>();
        let err = future.result(Some(Duration::from_millis(20))).unwrap_err();
        assert!(err.is_timeout());
        assert!(future.running());

        let worker = future.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            worker.set_result(11);
        });
        assert_eq!(future.result(Some(Duration::from_secs(5))).unwrap(), 11);
        handle.join().unwrap();
    }

    #[test]
    fn test_error_is_returned_on_every_call() {
        let future = running::<u32>();
        future.set_error(TaskError::failed(anyhow::anyhow!("lamp failure")));
        for _ in 0..3 {
            let err = future.result(None).unwrap_err();
            assert_eq!(err.to_string(), "lamp failure");
        }
    }

    #[test]
    fn test_outcome_is_set_once() {
        let future = running::<u32>();
        future.set_result(1);
        future.set_result(2);
        future.set_error(TaskError::Panicked("late".into()));
        assert_eq!(future.result(None).unwrap(), 1);
    }

    #[test]
    fn test_failed_future_is_terminal() {
        let future: TaskFuture<u32> = TaskFuture::failed(TaskError::Panicked("boom".into()));
        assert!(future.done());
        assert!(!future.cancel());
        assert!(matches!(future.result(None), Err(TaskError::Panicked(_))));
    }

    #[test]
    fn test_cancel_races_completion_exactly_once() {
        for _ in 0..50 {
            let future = running::<u32>();
            future.set_cancellation_hook(Arc::new(|| true));
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = calls.clone();
            future.add_done_callback(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

            let worker = future.clone();
            let handle = thread::spawn(move || worker.set_result(7));
            let cancelled = future.cancel();
            handle.join().unwrap();

            assert!(future.done());
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            match future.result(None) {
                Ok(7) => assert!(!cancelled),
                Err(TaskError::Cancelled) => assert!(cancelled),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[test]
    fn test_settle_hooks_run_before_waiters_wake() {
        let future = running::<u32>();
        let settled = Arc::new(AtomicBool::new(false));
        let flag = settled.clone();
        let id = future.id();
        future.on_settled(move |settled_id| {
            assert_eq!(settled_id, id);
            flag.store(true, Ordering::SeqCst);
        });

        let waiter = future.clone();
        let seen = settled.clone();
        let handle = thread::spawn(move || {
            waiter.result(None).unwrap();
            seen.load(Ordering::SeqCst)
        });
        thread::sleep(Duration::from_millis(10));
        future.set_result(3);
        assert!(handle.join().unwrap());

        // Already terminal: runs at once
        let late = Arc::new(AtomicBool::new(false));
        let flag = late.clone();
        future.on_settled(move |_| flag.store(true, Ordering::SeqCst));
        assert!(late.load(Ordering::SeqCst));
    }

    #[test]
    fn test_body_reporting_cancelled_cancels_future() {
        let future: TaskFuture<u8> = running();
        future.set_error(TaskError::Cancelled);
        assert_eq!(future.state(), TaskState::Cancelled);
        assert!(future.cancelled());
        assert!(future.cancel());
    }

    #[test]
    fn test_cancellable_trait_object() {
        let future = running::<String>();
        let erased: Arc<dyn Cancellable> = Arc::new(future.clone());
        assert_eq!(erased.id(), future.id());
        assert!(!erased.wait(Some(Duration::from_millis(5))));
        future.set_result("frame".to_string());
        assert!(erased.wait(None));
        assert!(erased.done());
    }

    #[tokio::test]
    async fn test_wait_async() {
        let future = running::<u32>();
        let worker = future.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            worker.set_result(21);
        });
        assert_eq!(future.wait_async().await.unwrap(), 21);
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_wait_async_cancelled() {
        let future: TaskFuture<u32> = TaskFuture::new();
        future.cancel();
        assert!(future.wait_async().await.unwrap_err().is_cancelled());
    }
}
