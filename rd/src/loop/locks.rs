//! Per-loop mutexes
//!
//! Every state-changing entry point holds its loop's mutex for the duration
//! of the call. Contention is rejected, not queued: the second caller gets
//! `already_in_progress`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use super::error::LoopError;

/// Map of per-loop mutexes
#[derive(Default)]
pub struct LoopLocks {
    map: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LoopLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the loop's mutex without waiting
    pub async fn try_acquire(&self, loop_id: &str) -> Result<OwnedMutexGuard<()>, LoopError> {
        let lock = {
            let mut map = self.map.lock().await;
            map.entry(loop_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.try_lock_owned().map_err(|_| LoopError::AlreadyInProgress)
    }

    /// Drop a purged loop's mutex entry
    pub async fn remove(&self, loop_id: &str) {
        self.map.lock().await.remove(loop_id);
    }
}
