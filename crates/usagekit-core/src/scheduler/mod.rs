//! Serial task scheduling.
//!
//! The tracker and publisher run all of their mutating work on a
//! [`Scheduler`]: immediate jobs via [`Scheduler::submit`] and delayed
//! jobs via [`Scheduler::schedule`], which hands back a cancellable
//! [`ScheduledHandle`].
//!
//! # Serial execution contract
//!
//! Implementations must not run two tasks of the same scheduler
//! concurrently. Components still guard their state with a mutex, but
//! the contract keeps lock hold times trivial and makes task ordering
//! deterministic. [`SingleThreadScheduler`] satisfies the contract with
//! a single worker thread; [`VirtualTimeScheduler`] satisfies it by
//! running due tasks inline on the thread that advances the clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod thread;
mod virtual_time;

pub use thread::SingleThreadScheduler;
pub use virtual_time::VirtualTimeScheduler;

/// A unit of work handed to a scheduler.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Delayed and immediate task execution.
pub trait Scheduler: Send + Sync {
    /// Enqueues a task for execution as soon as the scheduler is idle.
    fn submit(&self, task: Task);

    /// Schedules a task to run after `delay`. The returned handle
    /// cancels the task if it has not started yet.
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledHandle;
}

/// Cancellation handle for a scheduled task.
///
/// Cancellation is cooperative: a task that has already started runs to
/// completion, a task that has not started is discarded.
#[derive(Debug, Clone)]
pub struct ScheduledHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledHandle {
    pub(crate) fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Marks the task as cancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
