use std::time::Duration;

use baton_coord::{CoordResult, CoordinationStore, SetOptions};

pub const HEALTHY: &str = "healthy";

pub fn health_key(instance_id: &str) -> String {
    format!("worker_health:{instance_id}")
}

/// Writes `healthy` under `key` with a TTL. External monitors treat a missing
/// key as an unreachable or dead worker.
pub async fn check_health(
    store: &dyn CoordinationStore,
    key: &str,
    ttl: Duration,
) -> CoordResult<()> {
    store.set(key, HEALTHY, SetOptions::with_ttl(ttl)).await?;
    tracing::debug!(key, "health check written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_coord::{FaultPlan, FaultyStore, MemoryStore};

    #[tokio::test(start_paused = true)]
    async fn health_key_expires_unless_refreshed() {
        let store = MemoryStore::new();
        let key = health_key("A");
        check_health(&store, &key, Duration::from_secs(30))
            .await
            .expect("health");
        assert_eq!(store.get(&key).await.expect("get").as_deref(), Some(HEALTHY));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(store.get(&key).await.expect("get"), None);
    }

    #[tokio::test]
    async fn unreachable_store_is_reported() {
        let faulty = FaultyStore::new(MemoryStore::new());
        FaultPlan::enable(&faulty.plan().fail_set);
        assert!(check_health(&faulty, "k", Duration::from_secs(1)).await.is_err());
    }
}
