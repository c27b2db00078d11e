use std::sync::Arc;
use std::time::Duration;

use baton_coord::{CoordError, CoordResult, CoordinationStore, Subscription};
use baton_types::{ControlSignal, ResponseEvent, RunKeys};
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error(transparent)]
    Store(#[from] CoordError),
    #[error("no terminal marker after {0:?}")]
    TimedOut(Duration),
}

/// Caller-side view of a run: replay the response log, wait for growth,
/// ask the run to stop.
#[derive(Clone)]
pub struct RunReader {
    store: Arc<dyn CoordinationStore>,
    poll_interval: Duration,
}

impl RunReader {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Upper bound on how long a follower waits for a notification before
    /// re-reading the log anyway.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Records at index `offset` and later. Unparseable records are skipped.
    pub async fn read_from(&self, run_id: &str, offset: usize) -> CoordResult<Vec<ResponseEvent>> {
        Ok(self.fetch(run_id, offset).await?.1)
    }

    // Returns the raw record count alongside the parsed events so followers
    // can advance past malformed records.
    async fn fetch(&self, run_id: &str, offset: usize) -> CoordResult<(usize, Vec<ResponseEvent>)> {
        let raw = self
            .store
            .list_range(&RunKeys::new(run_id).responses(), offset as i64, -1)
            .await?;
        let events = raw
            .iter()
            .filter_map(|record| match ResponseEvent::from_json(record) {
                Ok(event) => Some(event),
                Err(err) => {
                    tracing::warn!(run_id, error = %err, "skipping malformed response record");
                    None
                }
            })
            .collect();
        Ok((raw.len(), events))
    }

    /// Notification subscription; each message is only a hint to re-read.
    pub async fn subscribe(&self, run_id: &str) -> CoordResult<Box<dyn Subscription>> {
        self.store
            .subscribe(&[RunKeys::new(run_id).notifications()])
            .await
    }

    /// Reads until the terminal marker shows up, waking on notifications and
    /// falling back to polling.
    pub async fn follow_until_terminal(
        &self,
        run_id: &str,
        timeout: Duration,
    ) -> Result<Vec<ResponseEvent>, ReadError> {
        let deadline = Instant::now() + timeout;
        let mut subscription = self.subscribe(run_id).await?;
        let mut events = Vec::new();
        let mut offset = 0;
        let result = loop {
            let (read, fresh) = self.fetch(run_id, offset).await?;
            offset += read;
            events.extend(fresh);
            if events.iter().any(|event| event.terminal_status().is_some()) {
                break Ok(events);
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(ReadError::TimedOut(timeout));
            }
            let wait = self.poll_interval.min(deadline - now);
            if let Err(err) = subscription.receive(wait).await {
                tracing::debug!(run_id, error = %err, "notification wait failed; polling");
                tokio::time::sleep(wait).await;
            }
        };
        if let Err(err) = subscription.close().await {
            tracing::debug!(run_id, error = %err, "failed to close notification subscription");
        }
        result
    }

    /// Targets the executing instance when known, otherwise every listener
    /// for the run.
    pub async fn request_stop(&self, run_id: &str, instance_id: Option<&str>) -> CoordResult<()> {
        let keys = RunKeys::new(run_id);
        let channel = match instance_id {
            Some(instance_id) => keys.instance_control(instance_id),
            None => keys.broadcast_control(),
        };
        tracing::info!(run_id, channel = %channel, "requesting run stop");
        self.store.publish(&channel, ControlSignal::Stop.as_str()).await
    }
}
