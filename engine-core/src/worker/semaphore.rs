use crate::{EngineError, Result};

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore as TokioSemaphore};

/// Counting semaphore guarding scarce daemon operations. Permits release on
/// drop, so a guard must be held for the whole operation.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<TokioSemaphore>,
    capacity: usize,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(TokioSemaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Waits for a permit. Fails with `Cancelled` only when the semaphore is
    /// closed; dropping the future while waiting relinquishes the spot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.inner
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Cancelled.into())
    }

    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.inner.clone().try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }

    /// Fails all current and future waiters.
    pub fn close(&self) {
        self.inner.close();
    }
}
