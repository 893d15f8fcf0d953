use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, error};

use crate::error::{Result, SchedulerError};

/// Bounded pool for blocking work (model loads, inference).
///
/// Each call takes a permit, then runs the closure on tokio's blocking
/// threads, so callers beyond `size` queue without stalling the runtime.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently running a closure.
    pub fn busy(&self) -> usize {
        self.size.saturating_sub(self.permits.available_permits())
    }

    /// A panic inside `work` comes back as `Internal` instead of unwinding
    /// into the caller.
    pub async fn run<F, T>(&self, label: &str, work: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SchedulerError::Internal("worker pool closed".to_string()))?;

        debug!("Worker running {} ({}/{} busy)", label, self.busy(), self.size);
        tokio::task::spawn_blocking(work).await.map_err(|e| {
            error!("Worker for {} did not complete: {}", label, e);
            SchedulerError::Internal(format!("worker for {} did not complete: {}", label, e))
        })
    }
}
