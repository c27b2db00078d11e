use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Context;
use baton_coord::{CoordError, CoordinationStore, SetOptions};
use baton_observability::{emit_event, ObservabilityEvent, ProcessKind};
use baton_persist::RunStatusStore;
use baton_types::{ResponseEvent, RunKeys, RunRequest, RunStatus, LIVENESS_MARKER};
use futures::FutureExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level};

use crate::config::WorkerConfig;
use crate::control::{ControlListener, ListenerHandle, ListenerSettings};
use crate::engine::ExecutionEngine;
use crate::finalizer::{FinalizeReport, RunFinalizer};
use crate::lock::RunLockManager;
use crate::pending::WriteQueue;
use crate::relay::{RelayOutcome, ResponseCounter, ResponseRelay};
use crate::status::StatusUpdater;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to acquire lock for run {run_id}: {source}")]
    Lock {
        run_id: String,
        #[source]
        source: CoordError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunReport {
    /// Another instance holds the run lock; nothing was executed.
    Skipped {
        run_id: String,
        holder: Option<String>,
    },
    Finished(FinalizeReport),
}

impl RunReport {
    pub fn status(&self) -> Option<RunStatus> {
        match self {
            RunReport::Skipped { .. } => None,
            RunReport::Finished(report) => Some(report.status),
        }
    }
}

/// Executes one run end to end on this instance: lock, listen, relay, finalize.
pub struct RunExecutor {
    store: Arc<dyn CoordinationStore>,
    statuses: Arc<dyn RunStatusStore>,
    engine: Arc<dyn ExecutionEngine>,
    config: Arc<WorkerConfig>,
}

impl RunExecutor {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        statuses: Arc<dyn RunStatusStore>,
        engine: Arc<dyn ExecutionEngine>,
        config: Arc<WorkerConfig>,
    ) -> Self {
        Self {
            store,
            statuses,
            engine,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Only a lock transport error is returned as `Err`; every other failure
    /// ends up in the finished report.
    pub async fn execute(&self, request: RunRequest) -> Result<RunReport, RunError> {
        let span = tracing::info_span!(
            "agent_run",
            run_id = %request.run_id,
            instance_id = %self.config.instance_id,
            thread_id = %request.thread_id,
            request_id = request.request_id.as_deref().unwrap_or(""),
        );
        self.execute_locked(request).instrument(span).await
    }

    async fn execute_locked(&self, request: RunRequest) -> Result<RunReport, RunError> {
        let instance_id = self.config.instance_id.as_str();
        let run_id = request.run_id.as_str();
        let locks = RunLockManager::new(self.store.clone());
        let acquired = locks
            .acquire(run_id, instance_id, self.config.lock_ttl())
            .await
            .map_err(|source| RunError::Lock {
                run_id: run_id.to_string(),
                source,
            })?;
        if !acquired {
            let holder = locks.holder(run_id).await.unwrap_or_else(|err| {
                tracing::warn!(error = %err, "could not read run lock holder");
                None
            });
            emit_event(
                Level::INFO,
                ProcessKind::Worker,
                ObservabilityEvent {
                    event: "run.skipped",
                    component: "lock",
                    run_id: Some(run_id),
                    instance_id: Some(instance_id),
                    detail: holder.as_deref(),
                    ..ObservabilityEvent::default()
                },
            );
            return Ok(RunReport::Skipped {
                run_id: run_id.to_string(),
                holder,
            });
        }
        emit_event(
            Level::INFO,
            ProcessKind::Worker,
            ObservabilityEvent {
                event: "run.lock_acquired",
                component: "lock",
                run_id: Some(run_id),
                instance_id: Some(instance_id),
                ..ObservabilityEvent::default()
            },
        );

        let keys = RunKeys::new(run_id);
        let run_token = CancellationToken::new();
        let counter = ResponseCounter::default();
        let mut queue = WriteQueue::spawn(
            self.store.clone(),
            &keys,
            self.config.write_queue_capacity,
        );
        let mut listener = None;
        let outcome = {
            let relay = ResponseRelay::new(&queue, counter.clone());
            self.drive(&request, &keys, &run_token, &counter, &relay, &mut listener)
                .await
        };

        let finalizer = RunFinalizer::new(
            self.store.clone(),
            StatusUpdater::new(
                self.statuses.clone(),
                self.config.status_attempts,
                self.config.status_backoff(),
            ),
            self.config.response_retention(),
            self.config.drain_timeout(),
        );
        let report = finalizer
            .finalize(&keys, instance_id, listener, &mut queue, outcome)
            .await;
        Ok(RunReport::Finished(report))
    }

    // Everything between lock acquisition and finalize. Faults and panics are
    // folded into a failed outcome so the caller always finalizes.
    async fn drive(
        &self,
        request: &RunRequest,
        keys: &RunKeys,
        run_token: &CancellationToken,
        counter: &ResponseCounter,
        relay: &ResponseRelay<'_>,
        listener: &mut Option<ListenerHandle>,
    ) -> RelayOutcome {
        let body = async {
            let handle = ControlListener::new(
                self.store.clone(),
                keys.clone(),
                self.config.instance_id.clone(),
                run_token.clone(),
                counter.clone(),
                self.listener_settings(),
            )
            .start()
            .await
            .context("control channel subscription failed")?;
            let control = handle.watch();
            *listener = Some(handle);

            if let Err(err) = self
                .store
                .set(
                    &keys.liveness(&self.config.instance_id),
                    LIVENESS_MARKER,
                    SetOptions::with_ttl(self.config.liveness_ttl()),
                )
                .await
            {
                tracing::warn!(error = %err, "failed to set liveness key");
            }

            let events = self
                .engine
                .start(request, run_token.child_token())
                .await
                .context("engine failed to start")?;
            relay.run(events, run_token, &control).await
        };

        match AssertUnwindSafe(body).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                let error = format!("{err:#}");
                self.fault(relay, counter, error).await
            }
            Err(panic) => {
                let error = format!("Engine panicked: {}", panic_message(panic.as_ref()));
                self.fault(relay, counter, error).await
            }
        }
    }

    async fn fault(
        &self,
        relay: &ResponseRelay<'_>,
        counter: &ResponseCounter,
        error: String,
    ) -> RelayOutcome {
        tracing::error!(error = %error, "agent run failed");
        relay
            .append(&ResponseEvent::status(RunStatus::Failed, Some(error.clone())))
            .await;
        RelayOutcome {
            status: RunStatus::Failed,
            error: Some(error),
            relayed: counter.get(),
        }
    }

    fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            poll_timeout: self.config.control_poll_timeout(),
            poll_sleep: self.config.control_poll_sleep(),
            refresh_every: self.config.liveness_refresh_every,
            liveness_ttl: self.config.liveness_ttl(),
            subscribe_attempts: self.config.subscribe_attempts,
            ..ListenerSettings::default()
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_rendered() {
        let from_str: Box<dyn Any + Send> = Box::new("static message");
        let from_string: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(from_str.as_ref()), "static message");
        assert_eq!(panic_message(from_string.as_ref()), "owned message");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[test]
    fn skipped_report_serializes_with_outcome_tag() {
        let report = RunReport::Skipped {
            run_id: "r1".to_string(),
            holder: Some("A".to_string()),
        };
        let value = serde_json::to_value(&report).expect("json");
        assert_eq!(value["outcome"], "skipped");
        assert_eq!(value["holder"], "A");
        assert_eq!(report.status(), None);
    }
}
