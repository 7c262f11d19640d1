//! Completion tracking for task packs and the strategies used to wait on
//! it.

use std::{
    hint,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Condvar, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_utils::CachePadded;
use once_cell::sync::OnceCell;

type Callback = Box<dyn Fn(usize) + Send + Sync + 'static>;

/// How waiters learn that a task pack has completed.
///
/// Selected when the pack is constructed. All three modes implement the same
/// contract (`wait` returns once every real task has signalled and its side
/// effects are visible) and differ only in where the waiting cost lands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitMode {
    /// Waiters poll the completion counter, sleeping for the configured
    /// interval between checks (busy-spinning when the interval is zero).
    /// Lowest wake-up latency and highest CPU cost; suits small packs of
    /// short tasks.
    Spin,

    /// One thread (typically the pack's wait task) polls the counter and
    /// then opens a blocking gate; every other waiter sleeps on the gate.
    /// A compromise when many threads wait on the same pack.
    SpinThenBlock,

    /// Every completion signal briefly takes a mutex and notifies a
    /// condition variable; nobody polls. Suits packs of long tasks where
    /// producers should not burn cycles.
    Blocking,
}

/// Shared completion state of one task pack.
///
/// Counter discipline: increments are `Release` read-modify-writes and
/// waiter loads are `Acquire`, so the release sequence on the counter
/// publishes every completed task's writes to any thread that observes the
/// final count.
///
/// Two counters are kept. `completed` is incremented before the per-task
/// callback runs, so a callback always observes its own task counted.
/// `retired` is incremented after the callback returns and is what waiters
/// key off, so `wait` cannot return while a callback is still running.
pub(crate) struct Completion {
    /// Number of real tasks; one less than the slot count when a wait task
    /// is embedded.
    target: AtomicUsize,

    completed: CachePadded<AtomicUsize>,
    retired: CachePadded<AtomicUsize>,

    interval: Mutex<Duration>,
    callback: OnceCell<Callback>,

    state: WaitState,
}

enum WaitState {
    Spin,
    SpinThenBlock { gate: BlockGate },
    Blocking { gate: BlockGate, signal: SignalGate },
}

impl Completion {
    pub(crate) fn new(target: usize, mode: WaitMode) -> Self {
        Self {
            target: AtomicUsize::new(target),
            completed: CachePadded::new(AtomicUsize::new(0)),
            retired: CachePadded::new(AtomicUsize::new(0)),
            interval: Mutex::new(Duration::ZERO),
            callback: OnceCell::new(),
            state: match mode {
                WaitMode::Spin => WaitState::Spin,
                WaitMode::SpinThenBlock => WaitState::SpinThenBlock {
                    gate: BlockGate::new(),
                },
                WaitMode::Blocking => WaitState::Blocking {
                    gate: BlockGate::new(),
                    signal: SignalGate::new(),
                },
            },
        }
    }

    pub(crate) fn target(&self) -> usize {
        self.target.load(Ordering::Acquire)
    }

    /// Exclude one slot from the completion target (it now holds the wait
    /// task rather than a real task).
    pub(crate) fn reduce_target(&self) {
        self.target.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn n_completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.retired.load(Ordering::Acquire) >= self.target()
    }

    pub(crate) fn set_interval(&self, interval: Duration) {
        *self.interval.lock().unwrap() = interval;
    }

    fn interval(&self) -> Duration {
        *self.interval.lock().unwrap()
    }

    /// Record the per-task callback. May be set at most once.
    pub(crate) fn set_callback<F>(&self, callback: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        if self.callback.set(Box::new(callback)).is_err() {
            panic!("completion callback already set");
        }
    }

    /// Called by every task closure after its body has run.
    pub(crate) fn signal_task_complete(&self, index: usize) {
        self.completed.fetch_add(1, Ordering::Release);

        if let Some(callback) = self.callback.get() {
            // A panicking callback must not leave the pack incomplete.
            let _ = catch_unwind(AssertUnwindSafe(|| callback(index)));
        }

        let retired = self.retired.fetch_add(1, Ordering::Release) + 1;
        let done = retired >= self.target();

        match &self.state {
            WaitState::Spin => {}
            WaitState::SpinThenBlock { gate } => {
                if done {
                    gate.open();
                }
            }
            WaitState::Blocking { gate, signal } => {
                signal.pulse();

                if done {
                    gate.open();
                }
            }
        }
    }

    /// Block the caller until every real task has signalled. Re-entrant:
    /// any number of threads may wait on the same pack.
    pub(crate) fn wait(&self) {
        match &self.state {
            WaitState::Spin => self.spin_until_done(),
            WaitState::SpinThenBlock { gate } | WaitState::Blocking { gate, .. } => {
                if self.is_done() {
                    return;
                }

                gate.wait();
            }
        }
    }

    /// As [`wait`](Completion::wait), giving up after `timeout`. Returns
    /// `true` if the pack completed in time.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        match &self.state {
            WaitState::Spin => self.spin_until_deadline(deadline),
            WaitState::SpinThenBlock { gate } | WaitState::Blocking { gate, .. } => {
                if self.is_done() {
                    return true;
                }

                gate.wait_deadline(deadline)
            }
        }
    }

    /// The completion barrier run inside a worker by an embedded wait task.
    ///
    /// Waits for every real task, then releases any threads blocked in
    /// [`wait`](Completion::wait).
    pub(crate) fn wait_complete(&self) {
        match &self.state {
            WaitState::Spin => self.spin_until_done(),
            WaitState::SpinThenBlock { gate } => {
                self.spin_until_done();
                gate.open();
            }
            WaitState::Blocking { gate, signal } => {
                signal.wait_until(|| self.is_done());
                gate.open();
            }
        }
    }

    fn spin_until_done(&self) {
        let interval = self.interval();

        while !self.is_done() {
            if interval.is_zero() {
                hint::spin_loop();
            } else {
                thread::sleep(interval);
            }
        }
    }

    fn spin_until_deadline(&self, deadline: Instant) -> bool {
        let interval = self.interval();

        while !self.is_done() {
            let now = Instant::now();

            if now >= deadline {
                return false;
            }

            if interval.is_zero() {
                hint::spin_loop();
            } else {
                thread::sleep(interval.min(deadline - now));
            }
        }

        true
    }
}

/// A one-way gate: closed until every real task has retired, then open
/// forever.
struct BlockGate {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl BlockGate {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn open(&self) {
        *self.done.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap();

        while !*done {
            done = self.condvar.wait(done).unwrap();
        }
    }

    fn wait_deadline(&self, deadline: Instant) -> bool {
        let mut done = self.done.lock().unwrap();

        while !*done {
            if let Some(timeout) = deadline.checked_duration_since(Instant::now()) {
                done = self.condvar.wait_timeout(done, timeout).unwrap().0;
            } else {
                return false;
            }
        }

        true
    }
}

/// The per-signal rendezvous used by [`WaitMode::Blocking`].
struct SignalGate {
    lock: Mutex<()>,
    condvar: Condvar,
}

impl SignalGate {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Notify after a completion signal. The lock is taken so a waiter
    /// between its predicate check and its sleep cannot miss the pulse.
    fn pulse(&self) {
        let _guard = self.lock.lock().unwrap();
        self.condvar.notify_all();
    }

    fn wait_until<P>(&self, predicate: P)
    where
        P: Fn() -> bool,
    {
        let mut guard = self.lock.lock().unwrap();

        while !predicate() {
            guard = self.condvar.wait(guard).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn zero_target_is_immediately_done() {
        for mode in [WaitMode::Spin, WaitMode::SpinThenBlock, WaitMode::Blocking] {
            let completion = Completion::new(0, mode);

            assert!(completion.is_done());
            completion.wait();
            assert!(completion.wait_timeout(Duration::ZERO));
        }
    }

    #[test]
    fn counts_signals() {
        let completion = Completion::new(3, WaitMode::Spin);

        completion.signal_task_complete(0);
        completion.signal_task_complete(1);
        assert_eq!(completion.n_completed(), 2);
        assert!(!completion.is_done());

        completion.signal_task_complete(2);
        assert!(completion.is_done());
        completion.wait();
    }

    #[test]
    fn wait_blocks_until_last_signal() {
        for mode in [WaitMode::Spin, WaitMode::SpinThenBlock, WaitMode::Blocking] {
            let completion = Arc::new(Completion::new(2, mode));
            completion.set_interval(Duration::from_micros(50));

            let signaller = {
                let completion = completion.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20));
                    completion.signal_task_complete(0);
                    thread::sleep(Duration::from_millis(20));
                    completion.signal_task_complete(1);
                })
            };

            completion.wait();
            assert!(completion.is_done());

            signaller.join().unwrap();
        }
    }

    #[test]
    fn wait_timeout_expires() {
        for mode in [WaitMode::Spin, WaitMode::SpinThenBlock, WaitMode::Blocking] {
            let completion = Completion::new(1, mode);
            completion.set_interval(Duration::from_micros(50));

            assert!(!completion.wait_timeout(Duration::from_millis(10)));

            completion.signal_task_complete(0);
            assert!(completion.wait_timeout(Duration::from_millis(10)));
        }
    }

    #[test]
    fn wait_complete_releases_blocked_waiters() {
        for mode in [WaitMode::SpinThenBlock, WaitMode::Blocking] {
            let completion = Arc::new(Completion::new(1, mode));
            completion.set_interval(Duration::from_micros(50));

            let waiter = {
                let completion = completion.clone();
                thread::spawn(move || completion.wait())
            };

            let barrier = {
                let completion = completion.clone();
                thread::spawn(move || completion.wait_complete())
            };

            thread::sleep(Duration::from_millis(20));
            completion.signal_task_complete(0);

            barrier.join().unwrap();
            waiter.join().unwrap();
        }
    }

    #[test]
    fn callback_runs_per_signal() {
        let completion = Completion::new(2, WaitMode::Spin);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        completion.set_callback(move |index| sink.lock().unwrap().push(index));

        completion.signal_task_complete(1);
        completion.signal_task_complete(0);

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1]);
    }

    #[test]
    #[should_panic(expected = "completion callback already set")]
    fn callback_cannot_be_set_twice() {
        let completion = Completion::new(1, WaitMode::Spin);

        completion.set_callback(|_| {});
        completion.set_callback(|_| {});
    }

    #[test]
    fn reduced_target_completes_early() {
        let completion = Completion::new(3, WaitMode::Spin);
        completion.reduce_target();

        completion.signal_task_complete(0);
        completion.signal_task_complete(1);

        assert!(completion.is_done());
    }
}
