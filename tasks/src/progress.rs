//! Progress estimation for task futures
//!
//! Every `TaskFuture` carries a start and an end estimate. Executors (and
//! long tasks themselves) refine them; subscribers get an `(elapsed,
//! remaining)` pair each time they change and once more when the task
//! settles.

use crate::future::{TaskFuture, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Elapsed time reported for a task that has not started yet.
///
/// This is a marker, not a measurement: it is never exactly zero so that
/// subscribers can tell "pending" from "just started".
pub const NOT_STARTED_ELAPSED: f64 = -1e-9;

/// Lead time of the default estimate for a freshly created task
const DEFAULT_LEAD_MS: i64 = 100;

pub(crate) type UpdateCallback = Arc<dyn Fn(TaskProgress) + Send + Sync>;

/// Progress of a task, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Time since the task started; the total duration once it is over
    pub elapsed: f64,
    /// Estimated time left; 0 once the task is over
    pub remaining: f64,
}

impl TaskProgress {
    pub fn is_pending(&self) -> bool {
        self.elapsed < 0.0
    }

    /// Completed fraction in [0, 1]
    pub fn fraction(&self) -> f64 {
        let total = self.elapsed + self.remaining;
        if self.elapsed <= 0.0 || total <= 0.0 {
            0.0
        } else {
            (self.elapsed / total).min(1.0)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ProgressTimes {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    expected: Option<chrono::Duration>,
}

impl ProgressTimes {
    pub(crate) fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            expected: None,
        }
    }

    /// Just a bit ahead of `now`, to say it's not starting right away
    pub(crate) fn estimated(now: DateTime<Utc>) -> Self {
        let lead = chrono::Duration::milliseconds(DEFAULT_LEAD_MS);
        let start = now + lead;
        Self::new(start, start + lead)
    }

    /// Zero-length interval for tasks that are over on creation
    pub(crate) fn instant(now: DateTime<Utc>) -> Self {
        Self::new(now, now)
    }

    pub(crate) fn start(&mut self, now: DateTime<Utc>) {
        if let Some(expected) = self.expected {
            self.end = now + expected;
        }
        self.start = now;
    }

    pub(crate) fn stop(&mut self, now: DateTime<Utc>) {
        // Never started: report a zero-length run
        if self.start > now {
            self.start = now;
        }
        self.end = now;
    }

    pub(crate) fn progress(&self, state: TaskState, now: DateTime<Utc>) -> TaskProgress {
        match state {
            TaskState::Cancelled | TaskState::CancelledNotified | TaskState::Finished => {
                TaskProgress {
                    elapsed: seconds(self.end - self.start),
                    remaining: 0.0,
                }
            }
            TaskState::Pending => {
                // past + left always adds up to the estimated duration
                let elapsed = seconds(now - self.start).min(NOT_STARTED_ELAPSED);
                TaskProgress {
                    elapsed,
                    remaining: seconds(self.end - self.start) - elapsed,
                }
            }
            TaskState::Running => {
                let mut remaining = seconds(self.end - now);
                if remaining < 0.0 {
                    tracing::debug!(
                        "Reporting progress on task which should have finished {:.3} s ago",
                        -remaining
                    );
                    remaining = 0.0;
                }
                TaskProgress {
                    elapsed: seconds(now - self.start),
                    remaining,
                }
            }
        }
    }
}

fn seconds(delta: chrono::Duration) -> f64 {
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1e6,
        None => delta.num_milliseconds() as f64 / 1e3,
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Anything that can report how far along it is
pub trait ProgressReporting: Send + Sync {
    fn progress(&self) -> TaskProgress;
    fn start_time(&self) -> DateTime<Utc>;
    fn end_time(&self) -> DateTime<Utc>;
}

impl<T: Send + 'static> ProgressReporting for TaskFuture<T> {
    fn progress(&self) -> TaskProgress {
        TaskFuture::progress(self)
    }

    fn start_time(&self) -> DateTime<Utc> {
        TaskFuture::start_time(self)
    }

    fn end_time(&self) -> DateTime<Utc> {
        TaskFuture::end_time(self)
    }
}

impl<T> TaskFuture<T> {
    /// Update the (expected) start time. To be used by executors and tasks only.
    pub fn set_start_time(&self, start: DateTime<Utc>) {
        let mut slot = self.lock();
        slot.times.start = start;
        self.notify_updates(slot);
    }

    /// Update the (expected) end time. To be used by executors and tasks only.
    pub fn set_end_time(&self, end: DateTime<Utc>) {
        let mut slot = self.lock();
        slot.times.end = end;
        self.notify_updates(slot);
    }

    /// Set the end estimate relative to now
    pub fn set_time_left(&self, left: Duration) {
        self.set_end_time(Utc::now() + to_chrono(left));
    }

    /// Expected run time; once the task starts, its end estimate becomes
    /// start + `expected`.
    pub fn set_expected_duration(&self, expected: Duration) {
        let mut slot = self.lock();
        let expected = to_chrono(expected);
        slot.times.expected = Some(expected);
        if slot.state == TaskState::Pending {
            slot.times.end = slot.times.start + expected;
        }
        self.notify_updates(slot);
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.lock().times.start
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.lock().times.end
    }

    /// Current progress snapshot
    pub fn progress(&self) -> TaskProgress {
        let slot = self.lock();
        slot.times.progress(slot.state, Utc::now())
    }

    /// Subscribe to progress updates.
    ///
    /// The callback immediately receives the current progress, even if the
    /// task is already over; it is only kept for later updates while the
    /// task is not terminal.
    pub fn add_update_callback<F>(&self, callback: F)
    where
        F: Fn(TaskProgress) + Send + Sync + 'static,
    {
        let callback: UpdateCallback = Arc::new(callback);
        let progress = {
            let mut slot = self.lock();
            if !slot.state.is_terminal() {
                slot.update_callbacks.push(callback.clone());
            }
            slot.times.progress(slot.state, Utc::now())
        };
        self.invoke_update(&callback, progress);
    }
}
