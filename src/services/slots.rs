//! Bounded per-caller concurrency for streaming endpoints.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::{GraphError, GraphResult};

/// One semaphore per caller, created on first use and dropped once the
/// caller has no open streams.
#[derive(Debug, Clone)]
pub struct StreamSlots {
    max_per_caller: usize,
    semaphores: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl StreamSlots {
    pub fn new(max_per_caller: usize) -> Self {
        Self {
            max_per_caller: max_per_caller.max(1),
            semaphores: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Take a slot without waiting. Fails with `RATE_LIMITED` when the
    /// caller already has the maximum number of open streams.
    pub fn try_acquire(&self, caller: &str) -> GraphResult<StreamSlot> {
        // Pruning and acquiring under one lock keeps a caller from ever
        // owning two semaphores.
        let mut semaphores = self.semaphores.lock().unwrap_or_else(|e| e.into_inner());
        let max = self.max_per_caller;
        semaphores.retain(|_, s| s.available_permits() < max);
        let semaphore = semaphores
            .entry(caller.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(max)))
            .clone();

        match semaphore.try_acquire_owned() {
            Ok(permit) => {
                debug!(caller, "stream slot acquired");
                Ok(StreamSlot {
                    caller: caller.to_string(),
                    permit: Some(permit),
                })
            }
            Err(_) => {
                warn!(caller, max, "no free stream slot");
                Err(GraphError::RateLimited { retry_after_secs: 1 })
            }
        }
    }

    /// Slots currently held by `caller`.
    pub fn in_use(&self, caller: &str) -> usize {
        let semaphores = self.semaphores.lock().unwrap_or_else(|e| e.into_inner());
        semaphores
            .get(caller)
            .map(|s| self.max_per_caller - s.available_permits())
            .unwrap_or(0)
    }

    pub fn max_per_caller(&self) -> usize {
        self.max_per_caller
    }

    /// Callers with a semaphore currently on record.
    pub fn tracked_callers(&self) -> usize {
        self.semaphores
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// A held stream slot. Releasing is idempotent and also happens on drop.
#[derive(Debug)]
pub struct StreamSlot {
    caller: String,
    permit: Option<OwnedSemaphorePermit>,
}

impl StreamSlot {
    pub fn release(&mut self) {
        if self.permit.take().is_some() {
            debug!(caller = %self.caller, "stream slot released");
        }
    }

    pub fn is_held(&self) -> bool {
        self.permit.is_some()
    }
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.release();
    }
}
