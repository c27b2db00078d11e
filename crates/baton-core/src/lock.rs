use std::sync::Arc;
use std::time::Duration;

use baton_coord::{CoordResult, CoordinationStore, SetOptions};
use baton_types::RunKeys;

/// Per-run mutual exclusion on top of the store's atomic set-if-absent.
///
/// Exclusivity is only as strong as the store's conditional set: the second
/// attempt in [`RunLockManager::acquire`] narrows the expiry race but relies on
/// that primitive being atomic under concurrent expiry.
#[derive(Clone)]
pub struct RunLockManager {
    store: Arc<dyn CoordinationStore>,
}

impl RunLockManager {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// `Ok(false)` means another instance holds the run. Transport errors are
    /// returned as-is; the caller must not start the run on `Err`.
    pub async fn acquire(&self, run_id: &str, instance_id: &str, ttl: Duration) -> CoordResult<bool> {
        let key = RunKeys::new(run_id).lock();
        let options = SetOptions::if_absent_with_ttl(ttl);
        if self.store.set(&key, instance_id, options).await? {
            tracing::debug!(run_id, instance_id, "run lock acquired");
            return Ok(true);
        }

        match self.store.get(&key).await? {
            Some(holder) if !holder.is_empty() => {
                tracing::info!(run_id, instance_id, holder = %holder, "run lock held by another instance");
                Ok(false)
            }
            _ => {
                // holder vanished between the failed set and the read
                let acquired = self.store.set(&key, instance_id, options).await?;
                tracing::info!(run_id, instance_id, acquired, "run lock retried after expiry race");
                Ok(acquired)
            }
        }
    }

    /// Deletes the lock regardless of holder. Failures are logged and reported
    /// as `false`; calling it again is harmless.
    pub async fn release(&self, run_id: &str) -> bool {
        let key = RunKeys::new(run_id).lock();
        match self.store.delete(&key).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(run_id, error = %err, "failed to release run lock");
                false
            }
        }
    }

    pub async fn holder(&self, run_id: &str) -> CoordResult<Option<String>> {
        self.store.get(&RunKeys::new(run_id).lock()).await
    }
}
