//! Worker pool: bounded execution slots with hard invocation timeouts
//!
//! Capacity bounds the number of simultaneously active sandboxes. A slot
//! is a semaphore permit; dropping it releases the slot, so a lifecycle
//! task that ends for any reason (including abort) gives its slot back.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::worker::{Capability, CapabilityError, WorkerOutcome, WorkerTask};

/// Errors from slot acquisition
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,
}

/// Errors from a pooled invocation
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The hard wall-clock limit elapsed. Always a failure; the sandbox is
    /// left in whatever state the worker abandoned it in.
    #[error("worker invocation timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

/// A leased execution slot
///
/// Holding a Slot is proof of pool capacity; it releases on drop.
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

/// Fixed-capacity worker pool
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Acquire a slot, waiting until one frees up
    pub async fn acquire(&self) -> Result<Slot, PoolError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        debug!(available = self.semaphore.available_permits(), "Slot acquired");
        Ok(Slot { _permit: permit })
    }

    /// Acquire a slot without waiting
    pub fn try_acquire(&self) -> Option<Slot> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Slot { _permit: permit })
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Invoke a capability under a hard wall-clock timeout
    ///
    /// On timeout the future is dropped and the error returned; the caller
    /// keeps its slot (and decides what to do with the abandoned sandbox).
    /// A timeout is never interpreted as partial success.
    pub async fn invoke(
        &self,
        _slot: &Slot,
        capability: &dyn Capability,
        task: &WorkerTask,
        timeout: Duration,
    ) -> Result<WorkerOutcome, InvokeError> {
        debug!(kind = %capability.kind(), feature = %task.feature_id, ?timeout, "Pool invoke");
        match tokio::time::timeout(timeout, capability.invoke(task)).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!(kind = %capability.kind(), feature = %task.feature_id, ?timeout, "Worker timed out");
                Err(InvokeError::TimedOut(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::worker::WorkerKind;

    struct SlowWorker {
        delay: Duration,
    }

    #[async_trait]
    impl Capability for SlowWorker {
        fn kind(&self) -> WorkerKind {
            WorkerKind::Coder
        }

        async fn invoke(&self, _task: &WorkerTask) -> Result<WorkerOutcome, CapabilityError> {
            tokio::time::sleep(self.delay).await;
            Ok(WorkerOutcome {
                success: true,
                artifacts_changed: vec![],
                notes: String::new(),
            })
        }
    }

    fn task() -> WorkerTask {
        WorkerTask::new("proj", "f-1", "work", "/tmp")
    }

    #[tokio::test]
    async fn test_capacity_bounds_slots() {
        let pool = WorkerPool::new(2);
        let a = pool.try_acquire();
        let b = pool.try_acquire();
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(pool.try_acquire().is_none());

        drop(a);
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_slot_released_on_drop() {
        let pool = WorkerPool::new(1);
        assert_eq!(pool.available(), 1);
        {
            let _slot = pool.acquire().await.unwrap();
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_invoke_within_timeout() {
        let pool = WorkerPool::new(1);
        let slot = pool.acquire().await.unwrap();
        let worker = SlowWorker {
            delay: Duration::from_millis(10),
        };

        let outcome = pool
            .invoke(&slot, &worker, &task(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_invoke_timeout_is_failure() {
        let pool = WorkerPool::new(1);
        let slot = pool.acquire().await.unwrap();
        let worker = SlowWorker {
            delay: Duration::from_secs(60),
        };

        let result = pool
            .invoke(&slot, &worker, &task(), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(InvokeError::TimedOut(_))));

        // Slot survives the timeout and is reclaimed on drop
        drop(slot);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let pool = Arc::new(WorkerPool::new(1));
        let slot = pool.acquire().await.unwrap();

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire().await.map(|_| ()) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(slot);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve after release")
            .unwrap()
            .unwrap();
    }
}
