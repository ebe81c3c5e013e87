use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, trace};

/// Runs decode and dispatch work off the I/O tasks, with a bounded number of tasks running
///  concurrently. Submitting never blocks: tasks beyond the limit wait for a permit.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> WorkerPool {
        WorkerPool {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn submit<F>(&self, task: F)
    where F: Future<Output = ()> + Send + 'static
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    trace!("worker pool is shut down - discarding task");
                    return;
                }
            };
            task.await;
        });
    }

    /// Tasks that did not start yet are discarded, running tasks complete
    pub fn shutdown(&self) {
        debug!("shutting down worker pool");
        self.permits.close();
    }

    pub fn idle_workers(&self) -> usize {
        self.permits.available_permits()
    }
}
