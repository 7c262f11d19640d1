//! A multi-producer multi-consumer worker pool with task packs.
//!
//! A [`TaskPool`] owns a resizable set of worker threads that cooperatively
//! drain one lock-free task queue fed by any number of producers. On top of
//! it, a [`TaskPack`] groups related tasks, tracks their completion,
//! collects their results and lets any thread block until the whole group
//! is done, with the waiting strategy ([`WaitMode`]) chosen per pack.
//!
//! # Examples
//!
//! Fan a computation out over a pack, then fold the results:
//!
//! ```
//! use taskwell::{TaskPack, TaskPool, WaitMode};
//!
//! let pool = TaskPool::with_size(4).unwrap();
//!
//! // 16 tasks computing squares, and a reduce step summing them.
//! let mut pack = TaskPack::<u64>::new(16, WaitMode::SpinThenBlock);
//!
//! for i in 0..16 {
//!     pack.set_task_at(i, move || (i as u64) * (i as u64));
//! }
//!
//! pack.set_reduce(|squares| squares.iter().sum());
//!
//! pool.submit_bulk(pack.take_tasks());
//!
//! assert_eq!(pack.get_result(), 1240);
//! ```
//!
//! Frequent producers can mint a [`ProducerToken`] for contention-free,
//! in-order submission:
//!
//! ```
//! let pool = taskwell::TaskPool::with_size(2).unwrap();
//! let token = pool.producer_token();
//!
//! for _ in 0..100 {
//!     pool.submit_with(&token, || {
//!         // do some work
//!     });
//! }
//! ```

mod error;
mod pack;
mod pool;
mod queue;
mod task;
mod wait;
mod wake;
mod worker;

pub use crate::{
    error::SpawnError,
    pack::TaskPack,
    pool::{Builder, TaskPool},
    queue::ProducerToken,
    task::Task,
    wait::WaitMode,
};
