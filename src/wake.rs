//! Parking and wake-up for idle workers.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Condvar, Mutex,
};

use crossbeam_utils::CachePadded;

/// Parks idle workers and wakes them when work arrives or the pool changes
/// shape.
///
/// Producers first read the sleeper count; while no worker is parked the
/// notification is skipped entirely and submission never touches the mutex.
/// When a notification is needed it is issued while holding the mutex, so a
/// worker that has re-checked its predicate but not yet begun waiting cannot
/// miss it. Workers advertise themselves in the sleeper count before taking
/// the lock; the count and the wake predicates are all SeqCst, so either the
/// producer sees the sleeper or the worker sees the freshly queued work.
pub(crate) struct WakeCoordinator {
    sleepers: CachePadded<AtomicUsize>,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl WakeCoordinator {
    pub(crate) fn new() -> Self {
        Self {
            sleepers: CachePadded::new(AtomicUsize::new(0)),
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Wake one parked worker, if any.
    pub(crate) fn notify_one(&self) {
        if self.sleepers.load(Ordering::SeqCst) == 0 {
            return;
        }

        let _guard = self.lock.lock().unwrap();
        self.condvar.notify_one();
    }

    /// Wake every parked worker.
    pub(crate) fn notify_all(&self) {
        if self.sleepers.load(Ordering::SeqCst) == 0 {
            return;
        }

        let _guard = self.lock.lock().unwrap();
        self.condvar.notify_all();
    }

    /// Park the calling worker until `should_wake` returns true.
    ///
    /// The predicate is re-checked under the lock before every sleep, which
    /// also absorbs spurious wake-ups.
    pub(crate) fn park<P>(&self, should_wake: P)
    where
        P: Fn() -> bool,
    {
        self.sleepers.fetch_add(1, Ordering::SeqCst);

        let mut guard = self.lock.lock().unwrap();
        while !should_wake() {
            guard = self.condvar.wait(guard).unwrap();
        }
        drop(guard);

        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }
}
