//! Packs of related tasks tracked as one unit.

use std::{
    cell::UnsafeCell,
    fmt, mem,
    panic::{catch_unwind, AssertUnwindSafe},
    slice,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver};

use crate::{
    task::Task,
    wait::{Completion, WaitMode},
};

type Reduce<R> = Box<dyn FnOnce(&[R]) -> R + Send + 'static>;

/// An ordered group of related tasks, tracked as one unit.
///
/// A pack is built with a fixed number of slots, populated with closures,
/// and handed to a pool with [`take_tasks`](TaskPack::take_tasks) +
/// [`TaskPool::submit_bulk`](crate::TaskPool::submit_bulk). As workers run
/// the tasks, the pack counts completions; any thread may then
/// [`wait`](TaskPack::wait) for the whole group, read individual results
/// with [`result_at`](TaskPack::result_at), or fold them into one value with
/// a [reduce closure](TaskPack::set_reduce) and
/// [`get_result`](TaskPack::get_result).
///
/// The result type parameter defaults to `()` for packs of tasks run purely
/// for their side effects.
///
/// How waiting is implemented is chosen per pack via [`WaitMode`].
///
/// # Examples
///
/// ```
/// use taskwell::{TaskPack, TaskPool, WaitMode};
///
/// let pool = TaskPool::with_size(4).unwrap();
///
/// let mut pack = TaskPack::<u64>::new(8, WaitMode::SpinThenBlock);
///
/// for i in 0..8 {
///     pack.set_task_at(i, move || (i as u64) * 10);
/// }
///
/// pack.set_reduce(|results| results.iter().sum());
///
/// pool.submit_bulk(pack.take_tasks());
///
/// assert_eq!(pack.get_result(), 280);
/// ```
///
/// # Lifetime
///
/// Task closures keep the pack's shared state alive on their own, so
/// dropping a `TaskPack` while its tasks are still running is memory-safe,
/// but the results become unobservable. Call `wait` (or `get_result`)
/// before letting a pack go.
pub struct TaskPack<R = ()> {
    inner: Arc<PackInner<R>>,

    /// Staged tasks, one per slot; `Task::empty()` marks a vacant slot.
    slots: Vec<Task>,

    wait_slot: Option<usize>,
    result_rx: Option<Receiver<R>>,
    taken: bool,
}

struct PackInner<R> {
    completion: Completion,

    /// One result cell per slot, each written by at most one worker.
    results: Box<[ResultCell<R>]>,

    /// Per-slot completion flags; release-stored after the result write,
    /// acquire-loaded before any read of the cell.
    done: Box<[AtomicBool]>,

    reduce: Mutex<Option<Reduce<R>>>,
    panicked: AtomicUsize,
}

#[repr(transparent)]
struct ResultCell<R>(UnsafeCell<R>);

// One worker writes each cell, and readers are gated on the `done` flag (or
// the pack-wide barrier), so the cell is never accessed concurrently with
// its write.
unsafe impl<R: Send> Sync for ResultCell<R> {}

impl<R> PackInner<R> {
    fn store_result(&self, index: usize, value: R) {
        unsafe {
            *self.results[index].0.get() = value;
        }
        self.done[index].store(true, Ordering::Release);
    }

    fn take_reduce(&self) -> Option<Reduce<R>> {
        self.reduce.lock().unwrap().take()
    }

    /// View every result cell as a plain slice.
    ///
    /// # Safety
    ///
    /// The caller must have passed the pack's completion barrier (`wait` or
    /// `wait_complete`), so that no cell can still be written. The cast is
    /// sound because `ResultCell` is `repr(transparent)` over
    /// `UnsafeCell<R>`, which is `repr(transparent)` over `R`.
    unsafe fn results(&self) -> &[R] {
        slice::from_raw_parts(self.results.as_ptr() as *const R, self.results.len())
    }
}

impl<R> TaskPack<R>
where
    R: Default + Send + 'static,
{
    /// Create a pack with `len` empty task slots.
    ///
    /// `mode` selects how completion is signalled and waited on; see
    /// [`WaitMode`]. A zero-length pack is permitted: it is trivially
    /// complete and submitting it is a no-op.
    pub fn new(len: usize, mode: WaitMode) -> Self {
        Self {
            inner: Arc::new(PackInner {
                completion: Completion::new(len, mode),
                results: (0..len).map(|_| ResultCell(UnsafeCell::new(R::default()))).collect(),
                done: (0..len).map(|_| AtomicBool::new(false)).collect(),
                reduce: Mutex::new(None),
                panicked: AtomicUsize::new(0),
            }),
            slots: (0..len).map(|_| Task::empty()).collect(),
            wait_slot: None,
            result_rx: None,
            taken: false,
        }
    }

    /// The number of slots in this pack.
    pub fn len(&self) -> usize {
        self.inner.done.len()
    }

    /// Whether this pack has no slots at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store the task for slot `index`.
    ///
    /// When a worker runs the task it computes `f()`, writes the value into
    /// the slot's result cell and signals completion. A panicking closure
    /// still signals (the pack would otherwise never complete) and is
    /// counted in [`n_panicked_tasks`](TaskPack::n_panicked_tasks); its
    /// result slot is left at the default value.
    ///
    /// Re-setting a slot replaces the previous closure.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds, if the slot holds the wait task,
    /// or if the tasks were already taken for submission.
    pub fn set_task_at<F>(&mut self, index: usize, f: F)
    where
        F: FnOnce() -> R + Send + 'static,
    {
        assert!(index < self.len(), "task index {index} out of bounds");
        assert!(!self.taken, "pack tasks already taken for submission");

        if self.wait_slot == Some(index) {
            panic!("slot {index} already holds the wait task");
        }

        let inner = self.inner.clone();

        self.slots[index] = Task::new(move || {
            match catch_unwind(AssertUnwindSafe(f)) {
                Ok(value) => inner.store_result(index, value),
                Err(_) => {
                    inner.panicked.fetch_add(1, Ordering::Relaxed);
                }
            }

            inner.completion.signal_task_complete(index);
        });
    }

    /// Install the pack's wait task into the (empty) slot `index`.
    ///
    /// The wait task is a task like any other, but instead of computing a
    /// value it performs the pack's completion barrier on whichever worker
    /// dequeues it: it waits for every real task, runs the
    /// [reduce closure](TaskPack::set_reduce) if one was set, and publishes
    /// the reduced value for [`get_result`](TaskPack::get_result). The slot
    /// no longer counts toward completion.
    ///
    /// The slot index is arbitrary; the barrier does not depend on the wait
    /// task being dequeued last.
    ///
    /// On a zero-length pack this call has no effect.
    ///
    /// Note that a wait task occupies a worker for as long as it waits: the
    /// pool should own at least one more worker than there are wait tasks
    /// in flight, or no worker may be left to run the tasks being waited
    /// for.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds, if a wait task was already
    /// installed, if the slot is occupied, or if the tasks were already
    /// taken for submission.
    pub fn set_wait_task_at(&mut self, index: usize) {
        if self.is_empty() {
            return;
        }

        assert!(index < self.len(), "task index {index} out of bounds");
        assert!(!self.taken, "pack tasks already taken for submission");

        if self.wait_slot.is_some() {
            panic!("wait task already set");
        }

        if !self.slots[index].is_empty() {
            panic!("slot {index} is already occupied");
        }

        self.inner.completion.reduce_target();

        let inner = self.inner.clone();
        let (tx, rx) = bounded(1);
        self.result_rx = Some(rx);

        self.slots[index] = Task::new(move || {
            inner.completion.wait_complete();

            if let Some(reduce) = inner.take_reduce() {
                // Safety: the barrier above observed every real task
                // retired.
                let results = unsafe { inner.results() };
                let _ = tx.send(reduce(results));
            }
        });

        self.wait_slot = Some(index);
    }

    /// Record a callback invoked once per completed task, with the task's
    /// slot index, after the completion count includes that task.
    ///
    /// # Panics
    ///
    /// Panics if a callback was already set, or if the tasks were already
    /// taken for submission.
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        assert!(!self.taken, "pack tasks already taken for submission");

        self.inner.completion.set_callback(callback);
    }

    /// Record the closure that folds the per-task results into one value.
    ///
    /// The reduce runs after every real task has completed, receiving the
    /// results in slot order: on a worker if a wait task is installed,
    /// otherwise inline in [`get_result`](TaskPack::get_result). Setting a
    /// new reduce replaces the previous one.
    ///
    /// # Panics
    ///
    /// Panics if the tasks were already taken for submission.
    pub fn set_reduce<F>(&mut self, reduce: F)
    where
        F: FnOnce(&[R]) -> R + Send + 'static,
    {
        assert!(!self.taken, "pack tasks already taken for submission");

        *self.inner.reduce.lock().unwrap() = Some(Box::new(reduce));
    }

    /// Set the polling interval used by the spinning wait strategies. Zero
    /// (the default) means busy-spinning.
    ///
    /// # Panics
    ///
    /// Panics if the tasks were already taken for submission.
    pub fn set_interval(&mut self, interval: Duration) {
        assert!(!self.taken, "pack tasks already taken for submission");

        self.inner.completion.set_interval(interval);
    }

    /// Move the populated tasks out for submission.
    ///
    /// The returned tasks are handed to
    /// [`TaskPool::submit_bulk`](crate::TaskPool::submit_bulk) (or any
    /// other submit method) by move. The pack itself stays behind to be
    /// waited on.
    ///
    /// # Panics
    ///
    /// Panics if any slot other than the wait-task slot is still vacant
    /// (workers skip empty tasks, so such a pack could never complete), or
    /// if the tasks were already taken.
    pub fn take_tasks(&mut self) -> Vec<Task> {
        assert!(!self.taken, "pack tasks already taken for submission");

        for (index, slot) in self.slots.iter().enumerate() {
            if slot.is_empty() {
                panic!("slot {index} has no task; populate every slot before submitting");
            }
        }

        self.taken = true;
        mem::take(&mut self.slots)
    }

    /// The result computed by the task at slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds or the task has not completed
    /// yet; observe completion first via [`wait`](TaskPack::wait), the
    /// callback, or [`n_completed_tasks`](TaskPack::n_completed_tasks).
    /// Wait-task and panicked slots never become readable this way.
    pub fn result_at(&self, index: usize) -> &R {
        assert!(index < self.len(), "task index {index} out of bounds");
        assert!(
            self.inner.done[index].load(Ordering::Acquire),
            "result {index} is not ready"
        );

        // Safety: the acquire load above synchronizes with the release
        // store made after the one write to this cell.
        unsafe { &*self.inner.results[index].0.get() }
    }

    /// Block until the pack completes, then return the reduced result.
    ///
    /// With a wait task installed, this blocks on the value the wait task
    /// publishes, shifting the waiting cost onto a worker. Without one, it
    /// [`wait`](TaskPack::wait)s and runs the reduce inline. Intended to be
    /// called once.
    ///
    /// # Panics
    ///
    /// Panics if no reduce closure was set.
    pub fn get_result(&mut self) -> R {
        if let Some(rx) = self.result_rx.take() {
            match rx.recv() {
                Ok(value) => value,
                Err(_) => {
                    panic!("wait task produced no result; set a reduce closure before submitting")
                }
            }
        } else {
            self.wait();

            let reduce = match self.inner.take_reduce() {
                Some(reduce) => reduce,
                None => panic!("no reduce closure set"),
            };

            // Safety: wait() observed every real task retired.
            let results = unsafe { self.inner.results() };
            reduce(results)
        }
    }

    /// Block until every real task in the pack has completed.
    ///
    /// May be called from any number of threads, before or after
    /// completion. All side effects of the pack's tasks are visible once
    /// this returns.
    pub fn wait(&self) {
        self.inner.completion.wait();
    }

    /// As [`wait`](TaskPack::wait), giving up after `timeout`.
    ///
    /// Returns `true` if the pack completed within the timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.inner.completion.wait_timeout(timeout)
    }

    /// Whether every real task has completed, without blocking.
    pub fn is_complete(&self) -> bool {
        self.inner.completion.is_done()
    }

    /// The number of tasks that have completed so far.
    pub fn n_completed_tasks(&self) -> usize {
        self.inner.completion.n_completed()
    }

    /// The number of tasks that panicked instead of producing a result.
    pub fn n_panicked_tasks(&self) -> usize {
        self.inner.panicked.load(Ordering::Relaxed)
    }
}

impl<R> fmt::Debug for TaskPack<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPack")
            .field("len", &self.inner.done.len())
            .field("completed", &self.inner.completion.n_completed())
            .field("target", &self.inner.completion.target())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_all(tasks: Vec<Task>) {
        for task in tasks {
            task.run();
        }
    }

    #[test]
    fn results_land_in_their_slots() {
        let mut pack = TaskPack::<usize>::new(4, WaitMode::Spin);

        for i in 0..4 {
            pack.set_task_at(i, move || i * i);
        }

        run_all(pack.take_tasks());
        pack.wait();

        assert_eq!(pack.n_completed_tasks(), 4);
        for i in 0..4 {
            assert_eq!(*pack.result_at(i), i * i);
        }
    }

    #[test]
    fn zero_length_pack_is_trivially_complete() {
        let mut pack = TaskPack::<()>::new(0, WaitMode::Blocking);

        pack.set_wait_task_at(0); // no effect
        assert!(pack.take_tasks().is_empty());

        pack.wait();
        assert!(pack.is_complete());
    }

    #[test]
    fn panicked_task_still_counts() {
        let mut pack = TaskPack::<u32>::new(2, WaitMode::Spin);

        pack.set_task_at(0, || 7);
        pack.set_task_at(1, || panic!("oh no!"));

        run_all(pack.take_tasks());
        pack.wait();

        assert_eq!(pack.n_completed_tasks(), 2);
        assert_eq!(pack.n_panicked_tasks(), 1);
        assert_eq!(*pack.result_at(0), 7);
    }

    #[test]
    #[should_panic(expected = "result 1 is not ready")]
    fn early_result_read_panics() {
        let mut pack = TaskPack::<u32>::new(2, WaitMode::Spin);

        pack.set_task_at(0, || 1);
        pack.set_task_at(1, || 2);

        let _ = pack.result_at(1);
    }

    #[test]
    #[should_panic(expected = "wait task already set")]
    fn wait_task_cannot_be_set_twice() {
        let mut pack = TaskPack::<()>::new(3, WaitMode::Blocking);

        pack.set_wait_task_at(0);
        pack.set_wait_task_at(1);
    }

    #[test]
    #[should_panic(expected = "slot 0 is already occupied")]
    fn wait_task_rejects_occupied_slot() {
        let mut pack = TaskPack::<()>::new(3, WaitMode::Blocking);

        pack.set_task_at(0, || {});
        pack.set_wait_task_at(0);
    }

    #[test]
    #[should_panic(expected = "slot 1 has no task")]
    fn vacant_slot_rejected_at_submission() {
        let mut pack = TaskPack::<()>::new(2, WaitMode::Spin);

        pack.set_task_at(0, || {});

        let _ = pack.take_tasks();
    }

    #[test]
    #[should_panic(expected = "pack tasks already taken for submission")]
    fn callback_rejected_after_submission() {
        let mut pack = TaskPack::<()>::new(1, WaitMode::Spin);

        pack.set_task_at(0, || {});
        let _tasks = pack.take_tasks();

        pack.set_callback(|_| {});
    }

    #[test]
    #[should_panic(expected = "pack tasks already taken for submission")]
    fn reduce_rejected_after_submission() {
        let mut pack = TaskPack::<u32>::new(1, WaitMode::Spin);

        pack.set_task_at(0, || 1);
        let _tasks = pack.take_tasks();

        pack.set_reduce(|results| results.iter().sum());
    }

    #[test]
    #[should_panic(expected = "pack tasks already taken for submission")]
    fn interval_rejected_after_submission() {
        let mut pack = TaskPack::<()>::new(1, WaitMode::Spin);

        pack.set_task_at(0, || {});
        let _tasks = pack.take_tasks();

        pack.set_interval(Duration::from_micros(10));
    }

    #[test]
    fn wait_task_runs_reduce() {
        let mut pack = TaskPack::<u64>::new(4, WaitMode::Blocking);

        for i in 0..3 {
            pack.set_task_at(i, move || i as u64 + 1);
        }
        pack.set_wait_task_at(3);
        pack.set_reduce(|results| results.iter().sum());

        // Running inline on this thread: the real tasks complete before the
        // wait task runs, so its barrier falls straight through.
        run_all(pack.take_tasks());

        // 1 + 2 + 3, plus the wait-task slot's default 0.
        assert_eq!(pack.get_result(), 6);
    }

    #[test]
    fn get_result_without_wait_task_reduces_inline() {
        let mut pack = TaskPack::<u64>::new(3, WaitMode::Spin);

        for i in 0..3 {
            pack.set_task_at(i, move || i as u64);
        }
        pack.set_reduce(|results| results.iter().sum());

        run_all(pack.take_tasks());

        assert_eq!(pack.get_result(), 3);
    }
}
