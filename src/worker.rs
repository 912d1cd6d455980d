//! Bounded pool for blocking model work.
//!
//! Model construction, generation and classifier forward passes run on
//! tokio's blocking threads. A semaphore caps how many run at once so a
//! burst of queries cannot oversubscribe the CPU/GPU, and the async
//! request loop only ever awaits the completion.

use crate::error::EngineError;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(max_concurrent: usize) -> Self {
        let capacity = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of jobs that could start right now without waiting.
    pub fn idle_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `job` on a blocking thread once a permit is free.
    ///
    /// The job always runs to completion even if the awaiting caller is
    /// dropped. A panic inside the job is reported as an inference error.
    pub async fn run<F, T>(&self, job: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Inference("worker pool is shut down".into()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| {
            if e.is_panic() {
                tracing::error!("Worker job panicked: {e}");
                EngineError::Inference(format!("worker job panicked: {e}"))
            } else {
                EngineError::Inference(format!("worker job was cancelled: {e}"))
            }
        })
    }
}
