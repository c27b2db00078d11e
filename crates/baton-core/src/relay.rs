use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use baton_types::{ResponseEvent, RunStatus};
use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::control::ListenerState;
use crate::engine::EventStream;
use crate::pending::WriteQueue;

pub const COMPLETED_MESSAGE: &str = "Agent run completed successfully";
pub const STOPPED_MESSAGE: &str = "Agent run stopped by request";

/// Count of response events relayed for a run, shared with the control
/// listener to pace liveness refreshes.
#[derive(Debug, Clone, Default)]
pub struct ResponseCounter(Arc<AtomicU64>);

impl ResponseCounter {
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub status: RunStatus,
    pub error: Option<String>,
    /// Engine events handed to the write queue, excluding synthesized markers.
    pub relayed: u64,
}

/// Moves engine events into the response log until a terminal marker,
/// exhaustion or cancellation.
pub struct ResponseRelay<'a> {
    queue: &'a WriteQueue,
    counter: ResponseCounter,
}

impl<'a> ResponseRelay<'a> {
    pub fn new(queue: &'a WriteQueue, counter: ResponseCounter) -> Self {
        Self { queue, counter }
    }

    /// An `Err` is an engine fault. Everything queued before it stays queued,
    /// and no terminal marker has been written for it yet. `control` explains
    /// a cancellation: a failed listener turns the stop into an error.
    pub async fn run(
        &self,
        mut events: EventStream,
        cancel: &CancellationToken,
        control: &watch::Receiver<ListenerState>,
    ) -> anyhow::Result<RelayOutcome> {
        let mut relayed = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(self.stopped(relayed, control).await),
                next = events.next() => next,
            };
            // a stop observed while the engine was producing wins over the event
            if cancel.is_cancelled() {
                return Ok(self.stopped(relayed, control).await);
            }
            let Some(item) = next else {
                self.append(&ResponseEvent::status(
                    RunStatus::Completed,
                    Some(COMPLETED_MESSAGE.to_string()),
                ))
                .await;
                return Ok(RelayOutcome {
                    status: RunStatus::Completed,
                    error: None,
                    relayed,
                });
            };
            let event = item?;
            self.append(&event).await;
            self.counter.increment();
            relayed += 1;

            if let Some(status) = event.terminal_status() {
                let error = match status {
                    RunStatus::Completed | RunStatus::Running => None,
                    RunStatus::Failed | RunStatus::Stopped => Some(
                        event
                            .message()
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("Run ended with status: {status}")),
                    ),
                };
                tracing::debug!(status = %status, relayed, "engine emitted terminal marker");
                return Ok(RelayOutcome {
                    status,
                    error,
                    relayed,
                });
            }
        }
    }

    async fn stopped(&self, relayed: u64, control: &watch::Receiver<ListenerState>) -> RelayOutcome {
        let error = match &*control.borrow() {
            ListenerState::Failed(reason) => Some(format!("Control channel failed: {reason}")),
            _ => None,
        };
        match &error {
            Some(error) => tracing::warn!(relayed, error = %error, "run cancelled after control channel failure"),
            None => tracing::info!(relayed, "run stopped by control signal"),
        }
        let message = error.clone().unwrap_or_else(|| STOPPED_MESSAGE.to_string());
        self.append(&ResponseEvent::status(RunStatus::Stopped, Some(message)))
            .await;
        RelayOutcome {
            status: RunStatus::Stopped,
            error,
            relayed,
        }
    }

    pub async fn append(&self, event: &ResponseEvent) {
        match event.to_json() {
            Ok(record) => {
                self.queue.push(record).await;
            }
            Err(err) => tracing::warn!(error = %err, "dropping unserializable response event"),
        }
    }
}
