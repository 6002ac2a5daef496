//! The fixed worker pool of §5's "Scheduling model".
//!
//! `W` worker threads are spawned once, at replica startup, and never torn
//! down until the process stops; each dequeues one piece of work at a time
//! from the shared `worker` work queue (see
//! [`crate::bft::core::workqueue`]) and runs it to completion before
//! picking up the next one. No blocking I/O ever runs on these threads —
//! that is the job of the input/output/execution/checkpoint threads.

use crate::bft::error::*;

#[cfg(feature = "threadpool_crossbeam")]
mod crossbeam_backend {
    pub type ThreadPool = threadpool_crossbeam_channel::ThreadPool;
    pub type Builder = threadpool_crossbeam_channel::Builder;
}

#[cfg(feature = "threadpool_crossbeam")]
pub use crossbeam_backend::{Builder, ThreadPool};

/// Spawns the fixed-size worker pool described in §2 and §5.
///
/// `num_threads` should equal the `THREAD_CNT` configuration option.
pub fn new(num_threads: usize) -> Result<ThreadPool> {
    if num_threads == 0 {
        return Err("Worker pool requires at least one thread")
            .wrapped(ErrorKind::Threadpool);
    }
    Ok(Builder::new().num_threads(num_threads).build())
}
