//! The unit of work consumed by the pool.

use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
};

/// An opaque, movable unit of work.
///
/// A task wraps an arbitrary closure producing no value. Any state the
/// producer needs is captured by the closure itself. Tasks are created from
/// closures via [`Task::new`] or the blanket [`From`] impl, so most of the
/// time you can hand a closure straight to the pool:
///
/// ```
/// let pool = taskwell::TaskPool::with_size(1).unwrap();
///
/// pool.submit(|| {
///     // do some work
/// });
/// ```
///
/// A task can also be *empty* ([`Task::empty`]). Empty tasks may travel
/// through the queue like any other; workers skip them silently.
pub struct Task(Option<Box<dyn FnOnce() + Send + 'static>>);

impl Task {
    /// Create a task from a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Some(Box::new(f)))
    }

    /// Create an empty task. Workers skip empty tasks without running
    /// anything.
    pub const fn empty() -> Self {
        Self(None)
    }

    /// Whether this task holds no closure.
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Run the task, catching any panic it raises.
    ///
    /// Returns `true` if the closure panicked. Running an empty task is a
    /// no-op reported as non-panicking; callers that care should check
    /// [`is_empty`](Task::is_empty) first.
    pub(crate) fn run(self) -> bool {
        match self.0 {
            Some(f) => catch_unwind(AssertUnwindSafe(f)).is_err(),
            None => false,
        }
    }
}

impl<F> From<F> for Task
where
    F: FnOnce() + Send + 'static,
{
    fn from(f: F) -> Self {
        Self::new(f)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("empty", &self.is_empty())
            .finish()
    }
}
