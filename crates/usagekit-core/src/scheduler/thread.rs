//! Production scheduler backed by one worker thread.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{ScheduledHandle, Scheduler, Task};

struct Entry {
    due: Instant,
    seq: u64,
    task: Task,
    cancelled: Arc<AtomicBool>,
}

// Min-heap ordering on (due, seq): earlier deadlines first, insertion
// order as the tie breaker.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

/// A scheduler that executes all tasks serially on one worker thread.
///
/// Dropping the scheduler stops the worker; tasks that have not started
/// by then are discarded.
pub struct SingleThreadScheduler {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl SingleThreadScheduler {
    /// Starts the worker thread.
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            available: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("usagekit-scheduler".to_string())
            .spawn(move || run_worker(&worker_shared))
            .ok();
        if worker.is_none() {
            tracing::error!("unable to spawn scheduler worker thread; tasks will not run");
        }
        Self { shared, worker }
    }

    fn push(&self, delay: Duration, task: Task, cancelled: Arc<AtomicBool>) {
        let mut queue = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Entry {
            due: Instant::now() + delay,
            seq,
            task,
            cancelled,
        });
        drop(queue);
        self.shared.available.notify_one();
    }
}

impl Default for SingleThreadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for SingleThreadScheduler {
    fn submit(&self, task: Task) {
        let handle = ScheduledHandle::new();
        self.push(Duration::ZERO, task, handle.flag());
    }

    fn schedule(&self, delay: Duration, task: Task) -> ScheduledHandle {
        let handle = ScheduledHandle::new();
        self.push(delay, task, handle.flag());
        handle
    }
}

impl Drop for SingleThreadScheduler {
    fn drop(&mut self) {
        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            queue.shutdown = true;
        }
        self.shared.available.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(shared: &Shared) {
    let mut queue = shared
        .queue
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    loop {
        if queue.shutdown {
            return;
        }
        let now = Instant::now();
        match queue.heap.peek() {
            None => {
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            Some(entry) if entry.due > now => {
                let wait = entry.due - now;
                queue = shared
                    .available
                    .wait_timeout(queue, wait)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            Some(_) => {
                let entry = queue.heap.pop().unwrap_or_else(|| unreachable!());
                drop(queue);
                if !entry.cancelled.load(Ordering::SeqCst) {
                    // A panicking task is the fatal path of the tracker
                    // and publisher; it must not take the scheduler
                    // down silently.
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(entry.task)) {
                        let message = panic_message(&panic);
                        tracing::error!(message, "scheduled task panicked");
                    }
                }
                queue = shared
                    .queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn submitted_tasks_run_in_submission_order() {
        let scheduler = SingleThreadScheduler::new();
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            scheduler.submit(Box::new(move || {
                let _ = tx.send(i);
            }));
        }
        let received: Vec<i32> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(received, vec![0, 1, 2, 3]);
    }

    #[test]
    fn delayed_task_fires_after_delay() {
        let scheduler = SingleThreadScheduler::new();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        scheduler.schedule(
            Duration::from_millis(50),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn cancelled_task_does_not_run() {
        let scheduler = SingleThreadScheduler::new();
        let (tx, rx) = mpsc::channel();
        let handle = scheduler.schedule(
            Duration::from_millis(100),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        handle.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn panicking_task_does_not_stop_the_worker() {
        let scheduler = SingleThreadScheduler::new();
        let (tx, rx) = mpsc::channel();
        scheduler.submit(Box::new(|| panic!("boom")));
        scheduler.submit(Box::new(move || {
            let _ = tx.send(());
        }));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
