use std::sync::Arc;
use std::time::Duration;

use baton_observability::{emit_event, ObservabilityEvent, ProcessKind};
use baton_persist::{RunStatusStore, StatusUpdate};
use baton_types::RunStatus;
use tracing::Level;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Writes the durable terminal status with bounded retries.
#[derive(Clone)]
pub struct StatusUpdater {
    store: Arc<dyn RunStatusStore>,
    attempts: u32,
    base_backoff: Duration,
}

impl StatusUpdater {
    pub fn new(store: Arc<dyn RunStatusStore>, attempts: u32, base_backoff: Duration) -> Self {
        Self {
            store,
            attempts: attempts.max(1),
            base_backoff,
        }
    }

    /// `true` once a write affected a row. Transport errors back off
    /// `base · 2^attempt` (capped at 30 s) before the next try; zero affected rows retries
    /// straight away. Never raises: exhaustion is logged and reported as `false`.
    pub async fn update(&self, run_id: &str, status: RunStatus, error: Option<&str>) -> bool {
        for attempt in 0..self.attempts {
            let update = StatusUpdate::new(status, error.map(str::to_string));
            match self.store.update_agent_run_status(run_id, &update).await {
                Ok(outcome) if outcome.affected() => {
                    tracing::debug!(run_id, status = %status, attempt, "run status persisted");
                    return true;
                }
                Ok(_) => {
                    tracing::warn!(run_id, status = %status, attempt, "status update matched no run record");
                }
                Err(err) => {
                    tracing::warn!(run_id, status = %status, attempt, error = %err, "status update failed");
                    if attempt + 1 < self.attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        tracing::error!(
            run_id,
            status = %status,
            attempts = self.attempts,
            "giving up on status update; durable record may still read running"
        );
        emit_event(
            Level::ERROR,
            ProcessKind::Worker,
            ObservabilityEvent {
                event: "run.status.degraded",
                component: "status",
                run_id: Some(run_id),
                status: Some(status.as_str()),
                error_code: Some("STATUS_PERSIST_EXHAUSTED"),
                ..ObservabilityEvent::default()
            },
        );
        false
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use baton_persist::{
        PersistError, PersistResult, RunDatabase, RunFilter, UpdateOutcome,
    };
    use baton_types::RunRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    /// Fails the first `failures` writes, then delegates.
    struct FlakyStatusStore {
        inner: RunDatabase,
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RunStatusStore for FlakyStatusStore {
        async fn insert_run(&self, record: &RunRecord) -> PersistResult<()> {
            self.inner.insert_run(record).await
        }

        async fn get_run(&self, run_id: &str) -> PersistResult<Option<RunRecord>> {
            self.inner.get_run(run_id).await
        }

        async fn update_agent_run_status(
            &self,
            run_id: &str,
            update: &StatusUpdate,
        ) -> PersistResult<UpdateOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(PersistError::InvalidQuery("connection reset".to_string()));
            }
            self.inner.update_agent_run_status(run_id, update).await
        }

        async fn list_runs(&self, filter: &RunFilter) -> PersistResult<Vec<RunRecord>> {
            self.inner.list_runs(filter).await
        }
    }

    async fn flaky(failures: usize) -> Arc<FlakyStatusStore> {
        let inner = RunDatabase::open_in_memory().await.expect("db");
        inner
            .insert_run(&RunRecord::started("r1", None))
            .await
            .expect("insert");
        Arc::new(FlakyStatusStore {
            inner,
            failures,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_then_success_takes_three_attempts_and_backs_off() {
        let store = flaky(2).await;
        let updater = StatusUpdater::new(store.clone(), 3, Duration::from_millis(500));
        let started = Instant::now();
        assert!(updater.update("r1", RunStatus::Failed, Some("boom")).await);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(1500));

        let record = store.get_run("r1").await.expect("get").expect("row");
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn three_failures_return_false() {
        let store = flaky(3).await;
        let updater = StatusUpdater::new(store.clone(), 3, Duration::from_millis(500));
        assert!(!updater.update("r1", RunStatus::Completed, None).await);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        let record = store.get_run("r1").await.expect("get").expect("row");
        assert_eq!(record.status, RunStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_record_retries_without_backoff_then_fails() {
        let store = flaky(0).await;
        let updater = StatusUpdater::new(store.clone(), 3, Duration::from_millis(500));
        let started = Instant::now();
        assert!(!updater.update("unknown", RunStatus::Completed, None).await);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_capped_for_long_retry_budgets() {
        let store = flaky(usize::MAX).await;
        let updater = StatusUpdater::new(store.clone(), 40, Duration::from_millis(500));
        assert_eq!(updater.backoff(0), Duration::from_millis(500));
        assert_eq!(updater.backoff(6), Duration::from_secs(30));
        assert_eq!(updater.backoff(35), Duration::from_secs(30));

        let started = Instant::now();
        assert!(!updater.update("r1", RunStatus::Failed, None).await);
        assert_eq!(store.calls.load(Ordering::SeqCst), 40);
        assert!(started.elapsed() <= Duration::from_secs(30 * 39));
    }
}
