//! Bounded request pool
//!
//! Write requests are built against a fixed-size pool so that flushing dirty
//! data can always make forward progress: when every slot is in use, the next
//! builder waits for one to free instead of failing. A permit lives as long
//! as its request record.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Slots reserved for requests that must not fail to allocate.
pub const POOL_SIZE: usize = 10;

pub struct RequestPool {
    slots: Arc<Semaphore>,
    size: usize,
}

impl RequestPool {
    pub fn new(size: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Take a slot, waiting if the pool is drained.
    pub async fn acquire(&self) -> PoolPermit {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .expect("request pool semaphore closed");
        PoolPermit { _permit: permit }
    }

    /// Take a slot without waiting, if one is free.
    pub fn try_acquire(&self) -> Option<PoolPermit> {
        Arc::clone(&self.slots)
            .try_acquire_owned()
            .ok()
            .map(|permit| PoolPermit { _permit: permit })
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// RAII guard for one pool slot; dropping it frees the slot.
#[derive(Debug)]
pub struct PoolPermit {
    _permit: OwnedSemaphorePermit,
}
