use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};

use super::{Task, TaskExecutor, TaskScheduler};

enum WorkerMsg {
    Run(Task),
    Stop,
}

/// Fixed pool of worker threads over a shared channel.
///
/// `pending` counts tasks that are queued or currently executing; a task's
/// own count is only released after `execute` returns, so anything it
/// submitted is already counted by then. `pending == 0` therefore means
/// full quiescence: no queued work, no running work. The joining thread
/// waits on that condition and runs the quiescence callback while every
/// worker is parked on the empty channel.
pub struct PoolScheduler {
    workers: usize,
    sender: Sender<WorkerMsg>,
    receiver: Receiver<WorkerMsg>,
    pending: Mutex<usize>,
    idle: Condvar,
    submitted: AtomicUsize,
    processed: AtomicUsize,
}

impl PoolScheduler {
    pub fn new(workers: usize) -> Self {
        let (sender, receiver) = unbounded();
        PoolScheduler {
            workers: workers.max(1),
            sender,
            receiver,
            pending: Mutex::new(0),
            idle: Condvar::new(),
            submitted: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn worker(&self, executor: &dyn TaskExecutor) {
        while let Ok(msg) = self.receiver.recv() {
            match msg {
                WorkerMsg::Run(task) => {
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    executor.execute(task);
                    let mut pending = self.pending.lock();
                    *pending -= 1;
                    if *pending == 0 {
                        self.idle.notify_all();
                    }
                }
                WorkerMsg::Stop => break,
            }
        }
    }

    fn send(&self, msg: WorkerMsg) {
        // Both channel ends live in self, so the channel never disconnects.
        self.sender
            .send(msg)
            .expect("worker channel disconnected");
    }
}

impl TaskScheduler for PoolScheduler {
    fn submit(&self, task: Task) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        *self.pending.lock() += 1;
        self.send(WorkerMsg::Run(task));
    }

    fn run(&self, executor: &dyn TaskExecutor) {
        std::thread::scope(|scope| {
            for _ in 0..self.workers {
                scope.spawn(|| self.worker(executor));
            }
            loop {
                let mut pending = self.pending.lock();
                while *pending != 0 {
                    self.idle.wait(&mut pending);
                }
                drop(pending);
                if !executor.on_quiescence() {
                    break;
                }
            }
            for _ in 0..self.workers {
                self.send(WorkerMsg::Stop);
            }
        });
    }

    fn submitted(&self) -> usize {
        self.submitted.load(Ordering::Relaxed)
    }

    fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fxprop::{ComputationResult, Entity, EntityRef};

    #[derive(Debug)]
    struct Node(u32);
    impl EntityRef for Node {}

    fn compute(id: u32) -> Task {
        Task::Compute {
            computation: Arc::new(|_, _| ComputationResult::NoResult),
            entity: Entity::new(Node(id)),
            kind: None,
        }
    }

    struct Reentrant<'a> {
        scheduler: &'a PoolScheduler,
        executed: AtomicUsize,
        respawns_left: AtomicUsize,
    }

    impl TaskExecutor for Reentrant<'_> {
        fn execute(&self, _task: Task) {
            self.executed.fetch_add(1, Ordering::Relaxed);
            if self
                .respawns_left
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok()
            {
                self.scheduler.submit(compute(u32::MAX));
            }
        }

        fn on_quiescence(&self) -> bool {
            false
        }
    }

    #[test]
    fn reentrant_submission_is_drained_before_join() {
        let scheduler = PoolScheduler::new(4);
        for id in 0..64 {
            scheduler.submit(compute(id));
        }
        let executor = Reentrant {
            scheduler: &scheduler,
            executed: AtomicUsize::new(0),
            respawns_left: AtomicUsize::new(32),
        };
        scheduler.run(&executor);
        assert_eq!(executor.executed.load(Ordering::Relaxed), 96);
        assert_eq!(scheduler.submitted(), 96);
        assert_eq!(scheduler.processed(), 96);
    }

    struct QuiescenceProbe<'a> {
        scheduler: &'a PoolScheduler,
        injections_left: AtomicUsize,
        callbacks: AtomicUsize,
    }

    impl TaskExecutor for QuiescenceProbe<'_> {
        fn execute(&self, _task: Task) {}

        fn on_quiescence(&self) -> bool {
            self.callbacks.fetch_add(1, Ordering::Relaxed);
            if self
                .injections_left
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok()
            {
                self.scheduler.submit(compute(0));
                true
            } else {
                false
            }
        }
    }

    #[test]
    fn quiescence_callback_reruns_until_no_progress() {
        let scheduler = PoolScheduler::new(2);
        scheduler.submit(compute(0));
        let executor = QuiescenceProbe {
            scheduler: &scheduler,
            injections_left: AtomicUsize::new(3),
            callbacks: AtomicUsize::new(0),
        };
        scheduler.run(&executor);
        assert_eq!(executor.callbacks.load(Ordering::Relaxed), 4);
        assert_eq!(scheduler.processed(), 4);
    }
}
