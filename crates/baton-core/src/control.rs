use std::sync::Arc;
use std::time::Duration;

use baton_coord::{CoordError, CoordResult, CoordinationStore, Subscription};
use baton_types::{ControlSignal, RunKeys};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::relay::ResponseCounter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    Starting,
    Listening,
    /// `STOP` arrived on one of the control channels.
    Stopped,
    /// The subscription broke; the run is cancelled as if stopped.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub poll_timeout: Duration,
    pub poll_sleep: Duration,
    pub refresh_every: u64,
    pub liveness_ttl: Duration,
    pub subscribe_attempts: u32,
    pub subscribe_backoff: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(500),
            poll_sleep: Duration::from_millis(100),
            refresh_every: 50,
            liveness_ttl: Duration::from_secs(3600),
            subscribe_attempts: 3,
            subscribe_backoff: Duration::from_millis(200),
        }
    }
}

/// Watches the instance and broadcast control channels for one run and flips
/// the run's cancellation token on `STOP`.
pub struct ControlListener {
    store: Arc<dyn CoordinationStore>,
    keys: RunKeys,
    instance_id: String,
    run_token: CancellationToken,
    counter: ResponseCounter,
    settings: ListenerSettings,
}

impl ControlListener {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: RunKeys,
        instance_id: impl Into<String>,
        run_token: CancellationToken,
        counter: ResponseCounter,
        settings: ListenerSettings,
    ) -> Self {
        Self {
            store,
            keys,
            instance_id: instance_id.into(),
            run_token,
            counter,
            settings,
        }
    }

    /// Subscribes, then spawns the poll loop. A subscription that cannot be
    /// established is returned as an error and the run must not proceed.
    pub async fn start(self) -> CoordResult<ListenerHandle> {
        let (state_tx, state_rx) = watch::channel(ListenerState::Starting);
        let subscription = match self.subscribe().await {
            Ok(subscription) => subscription,
            Err(err) => {
                state_tx.send_replace(ListenerState::Failed(err.to_string()));
                return Err(err);
            }
        };
        let shutdown = CancellationToken::new();
        state_tx.send_replace(ListenerState::Listening);
        let task = tokio::spawn(self.listen(subscription, state_tx, shutdown.clone()));
        Ok(ListenerHandle {
            shutdown,
            state: state_rx,
            task,
        })
    }

    async fn subscribe(&self) -> CoordResult<Box<dyn Subscription>> {
        let channels = [
            self.keys.instance_control(&self.instance_id),
            self.keys.broadcast_control(),
        ];
        let attempts = self.settings.subscribe_attempts.max(1);
        let mut last_err = CoordError::SubscriptionClosed;
        for attempt in 1..=attempts {
            match self.store.subscribe(&channels).await {
                Ok(subscription) => return Ok(subscription),
                Err(err) => {
                    tracing::warn!(
                        run_id = self.keys.run_id(),
                        attempt,
                        error = %err,
                        "control channel subscription failed"
                    );
                    last_err = err;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.subscribe_backoff).await;
            }
        }
        Err(last_err)
    }

    async fn listen(
        self,
        mut subscription: Box<dyn Subscription>,
        state: watch::Sender<ListenerState>,
        shutdown: CancellationToken,
    ) -> Box<dyn Subscription> {
        let liveness_key = self.keys.liveness(&self.instance_id);
        let refresh_every = self.settings.refresh_every.max(1);
        let mut refreshed_bucket = 0u64;
        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = subscription.receive(self.settings.poll_timeout) => received,
            };
            match received {
                Ok(Some(message)) => {
                    // subscription confirmations carry no payload
                    if let Some(payload) = message.payload() {
                        if ControlSignal::parse(payload) == Some(ControlSignal::Stop) {
                            tracing::info!(run_id = self.keys.run_id(), "stop signal received");
                            state.send_replace(ListenerState::Stopped);
                            self.run_token.cancel();
                            break;
                        }
                        tracing::debug!(run_id = self.keys.run_id(), payload, "ignoring control message");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(
                        run_id = self.keys.run_id(),
                        error = %err,
                        "control channel failed; cancelling run"
                    );
                    state.send_replace(ListenerState::Failed(err.to_string()));
                    self.run_token.cancel();
                    break;
                }
            }

            let bucket = self.counter.get() / refresh_every;
            if bucket > refreshed_bucket {
                refreshed_bucket = bucket;
                if let Err(err) = self
                    .store
                    .expire(&liveness_key, self.settings.liveness_ttl)
                    .await
                {
                    tracing::warn!(run_id = self.keys.run_id(), error = %err, "failed to refresh liveness key");
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_sleep) => {}
            }
        }
        subscription
    }
}

pub struct ListenerHandle {
    shutdown: CancellationToken,
    state: watch::Receiver<ListenerState>,
    task: JoinHandle<Box<dyn Subscription>>,
}

impl ListenerHandle {
    pub fn state(&self) -> ListenerState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }

    /// Ends the poll loop and hands back the subscription so the caller can
    /// unsubscribe and close it. `None` if the listener task panicked.
    pub async fn stop(self) -> Option<Box<dyn Subscription>> {
        self.shutdown.cancel();
        match self.task.await {
            Ok(subscription) => Some(subscription),
            Err(err) => {
                tracing::error!(error = %err, "control listener task failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_coord::{FaultPlan, FaultyStore, MemoryStore, SetOptions};

    fn listener(
        store: Arc<dyn CoordinationStore>,
        token: &CancellationToken,
        counter: &ResponseCounter,
    ) -> ControlListener {
        ControlListener::new(
            store,
            RunKeys::new("r1"),
            "A",
            token.clone(),
            counter.clone(),
            ListenerSettings {
                refresh_every: 2,
                liveness_ttl: Duration::from_secs(60),
                ..ListenerSettings::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn stop_on_instance_channel_cancels_run() {
        let store = MemoryStore::new();
        let token = CancellationToken::new();
        let handle = listener(Arc::new(store.clone()), &token, &ResponseCounter::default())
            .start()
            .await
            .expect("start");
        assert_eq!(handle.state(), ListenerState::Listening);

        store.publish("agent_run:r1:control:A", "STOP").await.expect("publish");
        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .expect("cancelled within a poll interval");
        let mut watch = handle.watch();
        watch
            .wait_for(|state| *state == ListenerState::Stopped)
            .await
            .expect("state");
        assert!(handle.stop().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn non_stop_payloads_are_ignored() {
        let store = MemoryStore::new();
        let token = CancellationToken::new();
        let handle = listener(Arc::new(store.clone()), &token, &ResponseCounter::default())
            .start()
            .await
            .expect("start");
        for payload in ["stop", "END_STREAM", "ERROR", " STOP"] {
            store.publish("agent_run:r1:control", payload).await.expect("publish");
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!token.is_cancelled());
        assert_eq!(handle.state(), ListenerState::Listening);

        store.publish("agent_run:r1:control", "STOP").await.expect("publish");
        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .expect("cancelled");
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn receive_failure_marks_failed_and_cancels() {
        let faulty = FaultyStore::new(MemoryStore::new());
        let token = CancellationToken::new();
        let handle = listener(Arc::new(faulty.clone()), &token, &ResponseCounter::default())
            .start()
            .await
            .expect("start");
        FaultPlan::enable(&faulty.plan().fail_receive);
        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .expect("cancelled");
        assert!(matches!(handle.state(), ListenerState::Failed(_)));
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_is_retried_then_fatal() {
        let faulty = FaultyStore::new(MemoryStore::new());
        faulty
            .plan()
            .fail_subscribe_times
            .store(2, std::sync::atomic::Ordering::SeqCst);
        let token = CancellationToken::new();
        let handle = listener(Arc::new(faulty.clone()), &token, &ResponseCounter::default())
            .start()
            .await
            .expect("third attempt succeeds");
        handle.stop().await;

        faulty
            .plan()
            .fail_subscribe_times
            .store(3, std::sync::atomic::Ordering::SeqCst);
        let result = listener(Arc::new(faulty), &token, &ResponseCounter::default())
            .start()
            .await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_ttl_is_refreshed_per_counter_bucket() {
        let store = MemoryStore::new();
        store
            .set(
                "active_run:A:r1",
                "running",
                SetOptions::with_ttl(Duration::from_secs(5)),
            )
            .await
            .expect("set");
        let token = CancellationToken::new();
        let counter = ResponseCounter::default();
        let handle = listener(Arc::new(store.clone()), &token, &counter)
            .start()
            .await
            .expect("start");

        counter.increment();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.ttl("active_run:A:r1").expect("ttl") <= Duration::from_secs(5));

        counter.increment();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.ttl("active_run:A:r1").expect("ttl") > Duration::from_secs(50));
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_returns_subscription_for_cleanup() {
        let store = MemoryStore::new();
        let token = CancellationToken::new();
        let handle = listener(Arc::new(store.clone()), &token, &ResponseCounter::default())
            .start()
            .await
            .expect("start");
        assert_eq!(store.subscriber_count("agent_run:r1:control"), 1);
        let mut subscription = handle.stop().await.expect("subscription");
        subscription.close().await.expect("close");
        assert_eq!(store.subscriber_count("agent_run:r1:control"), 0);
        assert!(!token.is_cancelled());
    }
}
