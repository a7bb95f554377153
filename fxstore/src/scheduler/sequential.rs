use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{Task, TaskExecutor, TaskScheduler};

/// Single-threaded FIFO worklist.
///
/// Tasks run on the thread that calls `run`, strictly in submission order,
/// which makes runs reproducible whenever the computations themselves are
/// deterministic.
pub struct SequentialScheduler {
    queue: Mutex<VecDeque<Task>>,
    submitted: AtomicUsize,
    processed: AtomicUsize,
}

impl SequentialScheduler {
    pub fn new() -> Self {
        SequentialScheduler {
            queue: Mutex::new(VecDeque::new()),
            submitted: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
        }
    }
}

impl Default for SequentialScheduler {
    fn default() -> Self {
        SequentialScheduler::new()
    }
}

impl TaskScheduler for SequentialScheduler {
    fn submit(&self, task: Task) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push_back(task);
    }

    fn run(&self, executor: &dyn TaskExecutor) {
        loop {
            let next = self.queue.lock().pop_front();
            match next {
                Some(task) => {
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    executor.execute(task);
                }
                None => {
                    if !executor.on_quiescence() {
                        break;
                    }
                }
            }
        }
    }

    fn submitted(&self) -> usize {
        self.submitted.load(Ordering::Relaxed)
    }

    fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }
}
