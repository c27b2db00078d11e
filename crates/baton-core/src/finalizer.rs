use std::sync::Arc;
use std::time::Duration;

use baton_coord::CoordinationStore;
use baton_observability::{emit_event, ObservabilityEvent, ProcessKind};
use baton_types::{ControlSignal, RunKeys, RunStatus};
use serde::Serialize;
use tracing::Level;

use crate::control::ListenerHandle;
use crate::lock::RunLockManager;
use crate::pending::{DrainOutcome, WriteQueue};
use crate::relay::RelayOutcome;
use crate::status::StatusUpdater;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStep {
    StopListener,
    CloseSubscription,
    RetainResponses,
    DeleteLiveness,
    ReleaseLock,
    DrainWrites,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizeReport {
    pub run_id: String,
    pub status: RunStatus,
    pub error: Option<String>,
    pub status_persisted: bool,
    pub sentinel: ControlSignal,
    pub sentinel_published: bool,
    /// Best-effort steps that failed; the rest still ran.
    pub cleanup_failures: Vec<CleanupStep>,
    pub drain_timed_out: bool,
}

/// Store-side cleanup for a run on this instance: retention TTL on the
/// response log, then liveness and lock deletion. Each step runs even if an
/// earlier one failed. Safe to call repeatedly.
pub async fn release_run_resources(
    store: &Arc<dyn CoordinationStore>,
    keys: &RunKeys,
    instance_id: &str,
    retention: Duration,
) -> Vec<CleanupStep> {
    let mut failures = Vec::new();
    let run_id = keys.run_id();
    if let Err(err) = store.expire(&keys.responses(), retention).await {
        tracing::warn!(run_id, error = %err, "failed to set response log retention");
        failures.push(CleanupStep::RetainResponses);
    }
    if let Err(err) = store.delete(&keys.liveness(instance_id)).await {
        tracing::warn!(run_id, error = %err, "failed to delete liveness key");
        failures.push(CleanupStep::DeleteLiveness);
    }
    if !RunLockManager::new(store.clone()).release(run_id).await {
        failures.push(CleanupStep::ReleaseLock);
    }
    failures
}

/// Ends a run: tears down signalling, releases keys, flushes pending writes,
/// then records and announces the outcome. Never fails; partial failures are
/// listed in the report.
pub struct RunFinalizer {
    store: Arc<dyn CoordinationStore>,
    status: StatusUpdater,
    retention: Duration,
    drain_timeout: Duration,
}

impl RunFinalizer {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        status: StatusUpdater,
        retention: Duration,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            store,
            status,
            retention,
            drain_timeout,
        }
    }

    pub async fn finalize(
        &self,
        keys: &RunKeys,
        instance_id: &str,
        listener: Option<ListenerHandle>,
        queue: &mut WriteQueue,
        outcome: RelayOutcome,
    ) -> FinalizeReport {
        let run_id = keys.run_id();
        let mut failures = Vec::new();

        if let Some(listener) = listener {
            match listener.stop().await {
                Some(mut subscription) => {
                    let unsubscribed = subscription.unsubscribe().await;
                    let closed = subscription.close().await;
                    if let Err(err) = unsubscribed.and(closed) {
                        tracing::warn!(run_id, error = %err, "failed to close control subscription");
                        failures.push(CleanupStep::CloseSubscription);
                    }
                }
                None => failures.push(CleanupStep::StopListener),
            }
        }

        failures.extend(
            release_run_resources(&self.store, keys, instance_id, self.retention).await,
        );

        let drain = queue.drain(self.drain_timeout).await;
        if !matches!(drain, DrainOutcome::Drained(_)) {
            failures.push(CleanupStep::DrainWrites);
        }
        // writes still pending during the first expire may have created the log
        if let Err(err) = self.store.expire(&keys.responses(), self.retention).await {
            tracing::warn!(run_id, error = %err, "failed to reapply response log retention");
            if !failures.contains(&CleanupStep::RetainResponses) {
                failures.push(CleanupStep::RetainResponses);
            }
        }

        let status_persisted = self
            .status
            .update(run_id, outcome.status, outcome.error.as_deref())
            .await;

        let sentinel = outcome
            .status
            .terminal_signal()
            .unwrap_or(ControlSignal::Error);
        let sentinel_published = match self
            .store
            .publish(&keys.broadcast_control(), sentinel.as_str())
            .await
        {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(run_id, sentinel = %sentinel, error = %err, "failed to publish terminal sentinel");
                false
            }
        };

        let report = FinalizeReport {
            run_id: run_id.to_string(),
            status: outcome.status,
            error: outcome.error,
            status_persisted,
            sentinel,
            sentinel_published,
            cleanup_failures: failures,
            drain_timed_out: drain.timed_out(),
        };
        emit_event(
            if report.cleanup_failures.is_empty() && status_persisted {
                Level::INFO
            } else {
                Level::WARN
            },
            ProcessKind::Worker,
            ObservabilityEvent {
                event: "run.finalized",
                component: "finalizer",
                run_id: Some(run_id),
                instance_id: Some(instance_id),
                status: Some(report.status.as_str()),
                detail: report.error.as_deref(),
                ..ObservabilityEvent::default()
            },
        );
        report
    }
}
