//! The task queue the pool drains: a shared injector plus producer-private
//! sub-queues.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, RwLock,
};

use crossbeam_deque::{Injector, Steal, Stealer, Worker as SubQueue};
use crossbeam_utils::CachePadded;

use crate::task::Task;

/// The multi-producer multi-consumer task queue.
///
/// Plain enqueues go through a shared [`Injector`]. A producer that submits
/// frequently can mint a [`ProducerToken`] instead, which routes its
/// enqueues through a private FIFO sub-queue so producers stop contending on
/// a single head. Consumers steal from the injector first and fall back to
/// the token sub-queues.
pub(crate) struct TaskQueue {
    core: Arc<QueueCore>,
}

struct QueueCore {
    injector: Injector<Task>,

    /// Stealer handles for every live token sub-queue, keyed by token id so
    /// a dropped token can deregister itself.
    stealers: RwLock<Vec<(usize, Stealer<Task>)>>,

    /// Approximate number of queued tasks. Incremented before a task is
    /// published and decremented after a successful steal, so it can
    /// over-report but never wraps. A hint only; never drives correctness.
    len: CachePadded<AtomicUsize>,

    next_token_id: AtomicUsize,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            core: Arc::new(QueueCore {
                injector: Injector::new(),
                stealers: RwLock::new(Vec::new()),
                len: CachePadded::new(AtomicUsize::new(0)),
                next_token_id: AtomicUsize::new(0),
            }),
        }
    }

    pub(crate) fn enqueue(&self, task: Task) {
        self.core.len.fetch_add(1, Ordering::SeqCst);
        self.core.injector.push(task);
    }

    pub(crate) fn enqueue_bulk(&self, tasks: Vec<Task>) {
        self.core.len.fetch_add(tasks.len(), Ordering::SeqCst);
        for task in tasks {
            self.core.injector.push(task);
        }
    }

    /// Take one task if any is currently available.
    ///
    /// Loops while any source reports a racy [`Steal::Retry`], so a transient
    /// collision between consumers cannot surface as a false "empty".
    pub(crate) fn try_dequeue(&self) -> Option<Task> {
        loop {
            let mut retry = false;

            match self.core.injector.steal() {
                Steal::Success(task) => {
                    self.core.len.fetch_sub(1, Ordering::SeqCst);
                    return Some(task);
                }
                Steal::Retry => retry = true,
                Steal::Empty => {}
            }

            let stealers = self.core.stealers.read().unwrap();
            for (_, stealer) in stealers.iter() {
                match stealer.steal() {
                    Steal::Success(task) => {
                        self.core.len.fetch_sub(1, Ordering::SeqCst);
                        return Some(task);
                    }
                    Steal::Retry => retry = true,
                    Steal::Empty => {}
                }
            }

            if !retry {
                return None;
            }
        }
    }

    /// A lower-bound hint of how many tasks are queued.
    pub(crate) fn size_approx(&self) -> usize {
        self.core.len.load(Ordering::SeqCst)
    }

    /// Mint a token whose enqueues go through a private sub-queue.
    pub(crate) fn producer_token(&self) -> ProducerToken {
        let local = SubQueue::new_fifo();
        let id = self.core.next_token_id.fetch_add(1, Ordering::Relaxed);

        self.core
            .stealers
            .write()
            .unwrap()
            .push((id, local.stealer()));

        ProducerToken {
            core: self.core.clone(),
            local,
            id,
        }
    }

    pub(crate) fn owns(&self, token: &ProducerToken) -> bool {
        Arc::ptr_eq(&self.core, &token.core)
    }
}

/// A handle identifying one producer to the pool's queue.
///
/// Minted by [`TaskPool::producer_token`](crate::TaskPool::producer_token).
/// Submissions made through a token land in a producer-private FIFO
/// sub-queue, avoiding contention with other producers; tasks submitted
/// through the same token are dequeued in submission order.
///
/// A token belongs to exactly one pool and keeps that pool's queue alive.
/// It can be moved to another thread but not shared between threads.
/// Dropping a token moves any tasks still sitting in its sub-queue into the
/// shared queue, so no work is lost.
pub struct ProducerToken {
    core: Arc<QueueCore>,
    local: SubQueue<Task>,
    id: usize,
}

impl ProducerToken {
    pub(crate) fn enqueue(&self, task: Task) {
        self.core.len.fetch_add(1, Ordering::SeqCst);
        self.local.push(task);
    }

    pub(crate) fn enqueue_bulk(&self, tasks: Vec<Task>) {
        self.core.len.fetch_add(tasks.len(), Ordering::SeqCst);
        for task in tasks {
            self.local.push(task);
        }
    }
}

impl Drop for ProducerToken {
    fn drop(&mut self) {
        // Unclaimed tasks survive the token.
        while let Some(task) = self.local.pop() {
            self.core.injector.push(task);
        }

        self.core
            .stealers
            .write()
            .unwrap()
            .retain(|(id, _)| *id != self.id);
    }
}

impl std::fmt::Debug for ProducerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerToken").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(queue: &TaskQueue) -> usize {
        let mut count = 0;
        while let Some(task) = queue.try_dequeue() {
            if !task.is_empty() {
                task.run();
            }
            count += 1;
        }
        count
    }

    #[test]
    fn enqueue_dequeue() {
        let queue = TaskQueue::new();
        assert!(queue.try_dequeue().is_none());

        queue.enqueue(Task::new(|| {}));
        assert_eq!(queue.size_approx(), 1);

        assert!(queue.try_dequeue().is_some());
        assert_eq!(queue.size_approx(), 0);
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn bulk_enqueue() {
        let queue = TaskQueue::new();

        queue.enqueue_bulk((0..10).map(|_| Task::new(|| {})).collect());

        assert_eq!(queue.size_approx(), 10);
        assert_eq!(drain(&queue), 10);
    }

    #[test]
    fn token_enqueues_are_dequeued() {
        let queue = TaskQueue::new();
        let token = queue.producer_token();

        token.enqueue(Task::new(|| {}));
        token.enqueue_bulk((0..4).map(|_| Task::new(|| {})).collect());

        assert_eq!(queue.size_approx(), 5);
        assert_eq!(drain(&queue), 5);
    }

    #[test]
    fn dropped_token_leaves_no_tasks_behind() {
        let queue = TaskQueue::new();

        let token = queue.producer_token();
        token.enqueue(Task::new(|| {}));
        token.enqueue(Task::new(|| {}));
        drop(token);

        assert_eq!(drain(&queue), 2);
    }

    #[test]
    fn empty_tasks_travel_through() {
        let queue = TaskQueue::new();

        queue.enqueue(Task::empty());

        let task = queue.try_dequeue().unwrap();
        assert!(task.is_empty());
    }

    #[test]
    fn token_identity() {
        let queue = TaskQueue::new();
        let other = TaskQueue::new();

        let token = queue.producer_token();
        assert!(queue.owns(&token));
        assert!(!other.owns(&token));
    }
}
