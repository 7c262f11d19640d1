//! The dispatch loop run by each pool thread.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{pool::Shared, task::Task};

/// A worker thread belonging to a pool.
///
/// A worker runs for as long as both the pool-wide active flag and its own
/// active flag are up. Work is pulled from the queue one task at a time;
/// when the queue looks empty the worker parks on the wake coordinator.
pub(crate) struct Worker {
    shared: Arc<Shared>,
    active: Arc<AtomicBool>,
}

impl Worker {
    pub(crate) fn new(shared: Arc<Shared>, active: Arc<AtomicBool>) -> Self {
        Self { shared, active }
    }

    pub(crate) fn run(&self) {
        // Both flags are re-checked after every task and every wake-up, so
        // shutdown and shrink take effect promptly. A worker told to exit
        // leaves remaining queued work to the surviving workers.
        while self.shared.is_active() && self.active.load(Ordering::SeqCst) {
            match self.shared.queue.try_dequeue() {
                Some(task) => self.execute(task),
                None => {
                    let shared = &self.shared;
                    let active = &self.active;

                    shared.wake.park(|| {
                        !shared.is_active()
                            || !active.load(Ordering::SeqCst)
                            || shared.queue.size_approx() > 0
                    });
                }
            }
        }
    }

    fn execute(&self, task: Task) {
        if task.is_empty() {
            return;
        }

        let panicked = task.run();
        self.shared.count_completed(panicked);
    }
}
