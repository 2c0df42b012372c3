//! Fixed-size pool of async tasks
//!
//! Submission never queues: a task either gets one of the pool's slots right
//! away or is rejected and dropped.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

/// Bounded pool of concurrently running tasks
#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    /// Slots not taken by running tasks
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `task` on `tracker` if a slot is free.
    ///
    /// Returns `false` when the pool is full; the task is dropped without
    /// ever being registered with `tracker`. The slot is released before the
    /// tracker sees the task finish.
    pub fn submit<F>(&self, tracker: &TaskTracker, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            return false;
        };

        tracker.spawn(async move {
            let _permit = permit;
            task.await;
        });
        true
    }
}
