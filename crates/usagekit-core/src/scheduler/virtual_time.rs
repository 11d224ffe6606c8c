//! Deterministic scheduler for tests.
//!
//! Time does not pass on its own: the test advances the clock with
//! [`VirtualTimeScheduler::advance_by`] and every task whose deadline is
//! reached runs inline on the calling thread, in deadline order with
//! submission order as the tie breaker. The queued/executed counters
//! mirror what the production scheduler would have done, which lets
//! tests assert on scheduling behavior (backoff delays, rescheduled
//! timeout chains) without sleeping.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{ScheduledHandle, Scheduler, Task};

struct QueuedAction {
    task: Task,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct VirtualState {
    now: Duration,
    next_seq: u64,
    queue: BTreeMap<(Duration, u64), QueuedAction>,
    executed: u64,
}

/// A scheduler driven by explicit time steps.
#[derive(Default)]
pub struct VirtualTimeScheduler {
    state: Mutex<VirtualState>,
}

impl VirtualTimeScheduler {
    /// Creates a scheduler with the clock at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock by `delta`, running every due task, and
    /// returns how many tasks executed. A zero `delta` runs the tasks
    /// that are already due.
    pub fn advance_by(&self, delta: Duration) -> u64 {
        let target = {
            let state = self.lock();
            state.now + delta
        };
        let mut executed_now = 0;
        loop {
            let action = {
                let mut state = self.lock();
                let due_key = state
                    .queue
                    .keys()
                    .next()
                    .copied()
                    .filter(|(tick, _)| *tick <= target);
                match due_key {
                    None => {
                        state.now = target;
                        break;
                    }
                    Some(key) => {
                        state.now = key.0;
                        state
                            .queue
                            .remove(&key)
                            .unwrap_or_else(|| unreachable!())
                    }
                }
            };
            if action.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            // Run outside the state lock: tasks may schedule or cancel.
            (action.task)();
            executed_now += 1;
            self.lock().executed += 1;
        }
        executed_now
    }

    /// Number of live (non-cancelled) actions waiting in the queue.
    #[must_use]
    pub fn actions_queued(&self) -> usize {
        self.lock()
            .queue
            .values()
            .filter(|action| !action.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Total number of actions executed since construction.
    #[must_use]
    pub fn actions_executed(&self) -> u64 {
        self.lock().executed
    }

    /// The current virtual clock, as time since the scheduler epoch.
    #[must_use]
    pub fn current_time(&self) -> Duration {
        self.lock().now
    }

    /// Absolute tick of the next live action, if any.
    #[must_use]
    pub fn next_action_tick(&self) -> Option<Duration> {
        let state = self.lock();
        state
            .queue
            .iter()
            .find(|(_, action)| !action.cancelled.load(Ordering::SeqCst))
            .map(|((tick, _), _)| *tick)
    }

    /// Remaining delay until the next live action, if any.
    #[must_use]
    pub fn next_action_delay(&self) -> Option<Duration> {
        let state = self.lock();
        let now = state.now;
        state
            .queue
            .iter()
            .find(|(_, action)| !action.cancelled.load(Ordering::SeqCst))
            .map(|((tick, _), _)| tick.saturating_sub(now))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VirtualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, delay: Duration, task: Task, cancelled: Arc<AtomicBool>) {
        let mut state = self.lock();
        let tick = state.now + delay;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.insert((tick, seq), QueuedAction { task, cancelled });
    }
}

impl Scheduler for VirtualTimeScheduler {
    fn submit(&self, task: Task) {
        let handle = ScheduledHandle::new();
        self.enqueue(Duration::ZERO, task, handle.flag());
    }

    fn schedule(&self, delay: Duration, task: Task) -> ScheduledHandle {
        let handle = ScheduledHandle::new();
        self.enqueue(delay, task, handle.flag());
        handle
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;

    #[test]
    fn submit_runs_on_zero_advance() {
        let scheduler = VirtualTimeScheduler::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        scheduler.submit(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert_eq!(scheduler.actions_queued(), 1);
        assert_eq!(scheduler.advance_by(Duration::ZERO), 1);
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(scheduler.actions_queued(), 0);
        assert_eq!(scheduler.actions_executed(), 1);
    }

    #[test]
    fn tasks_run_in_deadline_then_submission_order() {
        let scheduler = VirtualTimeScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay_secs, label) in [(2u64, "late"), (1, "early-a"), (1, "early-b")] {
            let order = Arc::clone(&order);
            scheduler.schedule(
                Duration::from_secs(delay_secs),
                Box::new(move || order.lock().unwrap().push(label)),
            );
        }
        assert_eq!(scheduler.advance_by(Duration::from_secs(2)), 3);
        assert_eq!(*order.lock().unwrap(), vec!["early-a", "early-b", "late"]);
    }

    #[test]
    fn cancelled_actions_leave_the_queue_and_do_not_execute() {
        let scheduler = VirtualTimeScheduler::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let handle = scheduler.schedule(
            Duration::from_secs(1),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(scheduler.actions_queued(), 1);
        handle.cancel();
        assert_eq!(scheduler.actions_queued(), 0);
        assert_eq!(scheduler.advance_by(Duration::from_secs(2)), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.actions_executed(), 0);
    }

    #[test]
    fn tasks_can_reschedule_themselves() {
        let scheduler = Arc::new(VirtualTimeScheduler::new());

        fn chain(scheduler: &Arc<VirtualTimeScheduler>, count: &Arc<AtomicU64>) {
            let scheduler_again = Arc::clone(scheduler);
            let count_again = Arc::clone(count);
            scheduler.schedule(
                Duration::from_secs(1),
                Box::new(move || {
                    count_again.fetch_add(1, Ordering::SeqCst);
                    chain(&scheduler_again, &count_again);
                }),
            );
        }

        let count = Arc::new(AtomicU64::new(0));
        chain(&scheduler, &count);
        assert_eq!(scheduler.advance_by(Duration::from_secs(3)), 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.actions_queued(), 1);
        assert_eq!(scheduler.current_time(), Duration::from_secs(3));
        assert_eq!(scheduler.next_action_tick(), Some(Duration::from_secs(4)));
        assert_eq!(scheduler.next_action_delay(), Some(Duration::from_secs(1)));
    }
}
