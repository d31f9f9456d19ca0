//! Fixed-size worker pool over a semaphore.
//!
//! Bounds how many tasks run concurrently. Futures waiting on a permit
//! yield to the runtime, so a stage with more tasks than workers simply
//! queues the excess.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Semaphore-bounded concurrent executor.
#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Currently free worker slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run one future under a pool permit.
    pub async fn run<T>(&self, fut: impl Future<Output = T>) -> T {
        // The semaphore is never closed; on the unreachable error path we
        // run unbounded rather than panic.
        let _permit = self.semaphore.acquire().await.ok();
        fut.await
    }

    /// Run a batch concurrently under the pool bound, preserving input
    /// order in the results.
    pub async fn run_all<T, F>(&self, futures: Vec<F>) -> Vec<T>
    where
        F: Future<Output = T>,
    {
        futures::future::join_all(futures.into_iter().map(|fut| self.run(fut))).await
    }

    /// Spawn a future onto the runtime, holding a pool permit for its
    /// lifetime.
    pub fn spawn<T, F>(&self, fut: F) -> JoinHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            fut.await
        })
    }
}
