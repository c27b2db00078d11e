use std::sync::Arc;
use std::time::Duration;

use baton_coord::CoordinationStore;
use baton_types::{RunKeys, NEW_RESPONSE_NOTIFICATION};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub appended: usize,
    pub append_failures: usize,
    pub notify_failures: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained(WriterStats),
    /// The writer was still busy when the timeout fired; it keeps running
    /// detached and may still land the remaining records.
    TimedOut,
    WriterLost,
}

impl DrainOutcome {
    pub fn timed_out(&self) -> bool {
        matches!(self, DrainOutcome::TimedOut)
    }
}

/// Ordered response writes for one run.
///
/// Producers hand serialized records to a bounded channel; a single writer
/// task appends each to the response log and then publishes the `new`
/// notification, so log order equals push order.
pub struct WriteQueue {
    tx: Option<mpsc::Sender<String>>,
    writer: Option<JoinHandle<WriterStats>>,
    run_id: String,
}

impl WriteQueue {
    pub fn spawn(store: Arc<dyn CoordinationStore>, keys: &RunKeys, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = tokio::spawn(write_loop(store, keys.clone(), rx));
        Self {
            tx: Some(tx),
            writer: Some(writer),
            run_id: keys.run_id().to_string(),
        }
    }

    /// Waits only when the queue is full. Returns `false` once the queue has
    /// been drained or the writer is gone.
    pub async fn push(&self, record: String) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        if tx.send(record).await.is_err() {
            tracing::warn!(run_id = %self.run_id, "response writer gone; record dropped");
            return false;
        }
        true
    }

    /// Closes the queue and waits for outstanding writes, at most `timeout`.
    /// Calling it again after a drain reports `WriterLost`.
    pub async fn drain(&mut self, timeout: Duration) -> DrainOutcome {
        self.tx.take();
        let Some(mut writer) = self.writer.take() else {
            return DrainOutcome::WriterLost;
        };
        match tokio::time::timeout(timeout, &mut writer).await {
            Ok(Ok(stats)) => DrainOutcome::Drained(stats),
            Ok(Err(err)) => {
                tracing::error!(run_id = %self.run_id, error = %err, "response writer task failed");
                DrainOutcome::WriterLost
            }
            Err(_) => {
                tracing::warn!(
                    run_id = %self.run_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out draining pending response writes"
                );
                DrainOutcome::TimedOut
            }
        }
    }
}

async fn write_loop(
    store: Arc<dyn CoordinationStore>,
    keys: RunKeys,
    mut rx: mpsc::Receiver<String>,
) -> WriterStats {
    let log_key = keys.responses();
    let channel = keys.notifications();
    let mut stats = WriterStats::default();
    while let Some(record) = rx.recv().await {
        if let Err(err) = store.list_append(&log_key, &record).await {
            stats.append_failures += 1;
            tracing::warn!(run_id = keys.run_id(), error = %err, "failed to append response");
            continue;
        }
        stats.appended += 1;
        if let Err(err) = store.publish(&channel, NEW_RESPONSE_NOTIFICATION).await {
            stats.notify_failures += 1;
            tracing::warn!(run_id = keys.run_id(), error = %err, "failed to publish response notification");
        }
    }
    stats
}
