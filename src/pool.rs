use std::{
    fmt, io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
};

#[cfg(taskwell_has_atomic64)]
use std::sync::atomic::AtomicU64 as LifetimeCounter;
#[cfg(not(taskwell_has_atomic64))]
use std::sync::atomic::AtomicUsize as LifetimeCounter;

use crate::{
    error::SpawnError,
    queue::{ProducerToken, TaskQueue},
    task::Task,
    wake::WakeCoordinator,
    worker::Worker,
};

/// A builder for constructing a customized task pool.
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    size: Option<usize>,
    stack_size: Option<usize>,
}

impl Builder {
    /// Set a custom thread name for threads spawned by this pool.
    ///
    /// The worker index is appended, so a pool named `"render"` spawns
    /// threads `render-0`, `render-1` and so on.
    ///
    /// # Panics
    ///
    /// Panics if the name contains null bytes (`\0`).
    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        let name = name.into();

        if name.as_bytes().contains(&0) {
            panic!("thread pool name must not contain null bytes");
        }

        self.name = Some(name);
        self
    }

    /// Set the number of worker threads the pool starts with.
    ///
    /// If not set, the number of CPU cores on the current system is used.
    /// The pool can be resized later with [`TaskPool::expand`] and
    /// [`TaskPool::shrink`].
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn size(mut self, size: usize) -> Self {
        if size == 0 {
            panic!("thread pool size must be non-zero");
        }

        self.size = Some(size);
        self
    }

    /// Set the size of the stack (in bytes) for threads in this pool.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// enforces a larger minimum stack size.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Create a task pool according to the configuration set with this
    /// builder.
    ///
    /// # Errors
    ///
    /// Returns a [`SpawnError`] if the operating system refused to create a
    /// worker thread. Workers spawned before the failure are shut down
    /// again before the error is returned.
    pub fn build(self) -> Result<TaskPool, SpawnError> {
        let size = self.size.unwrap_or_else(|| num_cpus::get().max(1));

        let pool = TaskPool {
            shared: Arc::new(Shared {
                queue: TaskQueue::new(),
                wake: WakeCoordinator::new(),
                active: AtomicBool::new(true),
                completed_tasks: LifetimeCounter::new(0),
                panicked_tasks: LifetimeCounter::new(0),
            }),
            members: Mutex::new(Members {
                workers: Vec::new(),
                next_id: 0,
            }),
            thread_name: self.name,
            stack_size: self.stack_size,
        };

        // On failure the partially built pool is dropped here, joining
        // whatever workers did spawn.
        pool.expand(size)?;

        Ok(pool)
    }
}

/// A pool of worker threads cooperatively draining one task queue.
///
/// Any number of producer threads submit [`Task`]s; the pool's workers
/// dequeue and run them. Submission never blocks. Producers that submit
/// often can mint a [`ProducerToken`] to cut queue contention, and bulk
/// submission amortises the wake-up cost across a whole batch, typically a
/// [`TaskPack`](crate::TaskPack).
///
/// Dropping the pool stops all workers: tasks already started run to
/// completion, tasks still queued are dropped. A pack whose tasks are
/// abandoned this way will never complete, so wait on in-flight packs
/// before dropping the pool that runs them.
///
/// # Examples
///
/// ```
/// use taskwell::{TaskPack, TaskPool, WaitMode};
///
/// let pool = TaskPool::with_size(2).unwrap();
///
/// let mut pack = TaskPack::<u64>::new(10, WaitMode::SpinThenBlock);
///
/// for i in 0..10 {
///     pack.set_task_at(i, move || i as u64 * 2);
/// }
///
/// pool.submit_bulk(pack.take_tasks());
/// pack.wait();
///
/// assert_eq!(*pack.result_at(3), 6);
/// ```
pub struct TaskPool {
    shared: Arc<Shared>,

    /// The structural lock: every change to pool membership happens with
    /// this mutex held.
    members: Mutex<Members>,

    thread_name: Option<String>,
    stack_size: Option<usize>,
}

struct Members {
    workers: Vec<WorkerHandle>,

    /// Monotonic worker id used for thread naming; never reused after a
    /// shrink.
    next_id: usize,
}

/// A worker's join handle paired with the flag that tells it to exit.
struct WorkerHandle {
    active: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl TaskPool {
    /// Create a pool with one worker per CPU core.
    ///
    /// # Errors
    ///
    /// Returns a [`SpawnError`] if the operating system refused to create a
    /// worker thread.
    #[inline]
    pub fn new() -> Result<Self, SpawnError> {
        Self::builder().build()
    }

    /// Create a pool with exactly `size` workers.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    ///
    /// # Errors
    ///
    /// Returns a [`SpawnError`] if the operating system refused to create a
    /// worker thread.
    #[inline]
    pub fn with_size(size: usize) -> Result<Self, SpawnError> {
        Self::builder().size(size).build()
    }

    /// Get a builder for creating a customized task pool.
    #[inline]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The number of worker threads currently in the pool.
    pub fn size(&self) -> usize {
        self.members.lock().unwrap().workers.len()
    }

    /// Mint a token granting this producer a private sub-queue.
    ///
    /// Tasks submitted through the token via [`submit_with`](Self::submit_with)
    /// or [`submit_bulk_with`](Self::submit_bulk_with) do not contend with
    /// other producers and are run in submission order relative to each
    /// other.
    pub fn producer_token(&self) -> ProducerToken {
        self.shared.queue.producer_token()
    }

    /// Submit a single task.
    ///
    /// ```
    /// let pool = taskwell::TaskPool::with_size(2).unwrap();
    ///
    /// pool.submit(|| {
    ///     // runs on a worker thread
    /// });
    /// ```
    pub fn submit(&self, task: impl Into<Task>) {
        self.shared.queue.enqueue(task.into());
        self.shared.wake.notify_one();
    }

    /// Submit a single task through a producer token.
    ///
    /// # Panics
    ///
    /// Panics if the token was minted by a different pool.
    pub fn submit_with(&self, token: &ProducerToken, task: impl Into<Task>) {
        self.assert_owns(token);

        token.enqueue(task.into());
        self.shared.wake.notify_one();
    }

    /// Submit a batch of tasks at once.
    ///
    /// The wake-up is issued once for the whole batch. Submitting an empty
    /// batch is a no-op.
    pub fn submit_bulk<I>(&self, tasks: I)
    where
        I: IntoIterator,
        I::Item: Into<Task>,
    {
        let tasks: Vec<Task> = tasks.into_iter().map(Into::into).collect();

        match tasks.len() {
            0 => {}
            n => {
                self.shared.queue.enqueue_bulk(tasks);
                self.wake_for(n);
            }
        }
    }

    /// Submit a batch of tasks through a producer token.
    ///
    /// # Panics
    ///
    /// Panics if the token was minted by a different pool.
    pub fn submit_bulk_with<I>(&self, token: &ProducerToken, tasks: I)
    where
        I: IntoIterator,
        I::Item: Into<Task>,
    {
        self.assert_owns(token);

        let tasks: Vec<Task> = tasks.into_iter().map(Into::into).collect();

        match tasks.len() {
            0 => {}
            n => {
                token.enqueue_bulk(tasks);
                self.wake_for(n);
            }
        }
    }

    /// Add `additional` workers to the pool.
    ///
    /// # Errors
    ///
    /// Returns a [`SpawnError`] if the operating system refused to create a
    /// thread. Workers spawned before the failure stay in the pool;
    /// [`SpawnError::spawned`] reports how many.
    pub fn expand(&self, additional: usize) -> Result<(), SpawnError> {
        let mut members = self.members.lock().unwrap();

        for spawned in 0..additional {
            if let Err(source) = self.spawn_worker(&mut members) {
                return Err(SpawnError::new(spawned, source));
            }
        }

        Ok(())
    }

    /// Remove up to `n` workers from the pool, blocking until they exit.
    ///
    /// The most recently spawned workers go first. A worker in the middle
    /// of a task finishes that task before exiting; tasks still queued are
    /// left for the surviving workers. Shrinking by more than the current
    /// size leaves the pool at zero workers but otherwise intact; a later
    /// [`expand`](Self::expand) revives it.
    pub fn shrink(&self, n: usize) {
        let mut members = self.members.lock().unwrap();

        let n = n.min(members.workers.len());
        if n == 0 {
            return;
        }

        let keep = members.workers.len() - n;
        let doomed = members.workers.split_off(keep);

        for handle in &doomed {
            handle.active.store(false, Ordering::SeqCst);
        }

        // Everyone wakes; only the flagged workers exit.
        self.shared.wake.notify_all();

        for handle in doomed {
            let _ = handle.thread.join();
        }
    }

    /// A lower-bound hint of the number of tasks queued but not yet
    /// started.
    pub fn queued_tasks(&self) -> usize {
        self.shared.queue.size_approx()
    }

    /// Get the number of tasks completed (successfully or otherwise) by
    /// this pool since it was created.
    pub fn completed_tasks(&self) -> u64 {
        self.shared.completed_tasks.load(Ordering::SeqCst) as u64
    }

    /// Get the number of tasks that have panicked since the pool was
    /// created.
    pub fn panicked_tasks(&self) -> u64 {
        self.shared.panicked_tasks.load(Ordering::SeqCst) as u64
    }

    fn wake_for(&self, n: usize) {
        if n == 1 {
            self.shared.wake.notify_one();
        } else {
            self.shared.wake.notify_all();
        }
    }

    fn assert_owns(&self, token: &ProducerToken) {
        assert!(
            self.shared.queue.owns(token),
            "producer token belongs to a different pool"
        );
    }

    fn spawn_worker(&self, members: &mut Members) -> io::Result<()> {
        let active = Arc::new(AtomicBool::new(true));
        let worker = Worker::new(self.shared.clone(), active.clone());

        let mut builder = thread::Builder::new().name(format!(
            "{}-{}",
            self.thread_name.as_deref().unwrap_or("taskwell"),
            members.next_id
        ));

        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        let thread = builder.spawn(move || worker.run())?;

        members.next_id += 1;
        members.workers.push(WorkerHandle { active, thread });

        Ok(())
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shared.active.store(false, Ordering::SeqCst);
        self.shared.wake.notify_all();

        let mut members = self.members.lock().unwrap();

        // Workers are joined even if their own flag is still up; the queue
        // and whatever tasks remain in it are dropped afterwards.
        for handle in members.workers.drain(..) {
            let _ = handle.thread.join();
        }
    }
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("size", &self.size())
            .field("queued_tasks", &self.queued_tasks())
            .field("completed_tasks", &self.completed_tasks())
            .finish()
    }
}

/// Pool state shared by the owner and the worker threads.
pub(crate) struct Shared {
    pub(crate) queue: TaskQueue,
    pub(crate) wake: WakeCoordinator,
    active: AtomicBool,
    completed_tasks: LifetimeCounter,
    panicked_tasks: LifetimeCounter,
}

impl Shared {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn count_completed(&self, panicked: bool) {
        self.completed_tasks.fetch_add(1, Ordering::SeqCst);

        if panicked {
            self.panicked_tasks.fetch_add(1, Ordering::SeqCst);
        }
    }
}
