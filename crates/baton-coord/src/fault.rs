use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{
    CoordError, CoordResult, CoordinationStore, MemoryStore, PubSubMessage, SetOptions,
    Subscription,
};

/// Switchboard of failures a [`FaultyStore`] injects. Toggles can be flipped
/// while a run is in flight.
#[derive(Default)]
pub struct FaultPlan {
    pub fail_set: AtomicBool,
    pub fail_get: AtomicBool,
    pub fail_delete: AtomicBool,
    pub fail_expire: AtomicBool,
    pub fail_list_append: AtomicBool,
    pub fail_publish: AtomicBool,
    pub fail_receive: AtomicBool,
    pub fail_close: AtomicBool,
    /// Milliseconds every `list_append` sleeps before writing.
    pub append_delay_ms: AtomicU64,
    /// Number of upcoming `subscribe` calls that fail.
    pub fail_subscribe_times: AtomicUsize,
    /// One-shot: when a conditional set is rejected, delete the key before
    /// returning, reproducing a holder expiring between `set` and `get`.
    pub expire_after_rejected_set: AtomicBool,
    pub set_calls: AtomicUsize,
    pub subscribe_calls: AtomicUsize,
}

impl FaultPlan {
    pub fn enable(flag: &AtomicBool) {
        flag.store(true, Ordering::SeqCst);
    }

    pub fn disable(flag: &AtomicBool) {
        flag.store(false, Ordering::SeqCst);
    }

    fn active(flag: &AtomicBool) -> bool {
        flag.load(Ordering::SeqCst)
    }
}

fn injected(operation: &str) -> CoordError {
    tracing::debug!(operation, "injecting coordination store failure");
    CoordError::Transport(format!("injected {operation} failure"))
}

#[derive(Clone)]
pub struct FaultyStore {
    inner: MemoryStore,
    plan: Arc<FaultPlan>,
}

impl FaultyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            plan: Arc::new(FaultPlan::default()),
        }
    }

    pub fn plan(&self) -> &FaultPlan {
        &self.plan
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait::async_trait]
impl CoordinationStore for FaultyStore {
    async fn set(&self, key: &str, value: &str, options: SetOptions) -> CoordResult<bool> {
        self.plan.set_calls.fetch_add(1, Ordering::SeqCst);
        if FaultPlan::active(&self.plan.fail_set) {
            return Err(injected("set"));
        }
        let stored = self.inner.set(key, value, options).await?;
        if !stored
            && options.if_not_exists
            && self
                .plan
                .expire_after_rejected_set
                .swap(false, Ordering::SeqCst)
        {
            self.inner.delete(key).await?;
        }
        Ok(stored)
    }

    async fn get(&self, key: &str) -> CoordResult<Option<String>> {
        if FaultPlan::active(&self.plan.fail_get) {
            return Err(injected("get"));
        }
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> CoordResult<()> {
        if FaultPlan::active(&self.plan.fail_delete) {
            return Err(injected("delete"));
        }
        self.inner.delete(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CoordResult<()> {
        if FaultPlan::active(&self.plan.fail_expire) {
            return Err(injected("expire"));
        }
        self.inner.expire(key, ttl).await
    }

    async fn list_append(&self, key: &str, value: &str) -> CoordResult<()> {
        if FaultPlan::active(&self.plan.fail_list_append) {
            return Err(injected("list_append"));
        }
        let delay = self.plan.append_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.list_append(key, value).await
    }

    async fn list_range(&self, key: &str, start: i64, end: i64) -> CoordResult<Vec<String>> {
        self.inner.list_range(key, start, end).await
    }

    async fn publish(&self, channel: &str, message: &str) -> CoordResult<()> {
        if FaultPlan::active(&self.plan.fail_publish) {
            return Err(injected("publish"));
        }
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channels: &[String]) -> CoordResult<Box<dyn Subscription>> {
        self.plan.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.plan.fail_subscribe_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.plan
                .fail_subscribe_times
                .store(remaining - 1, Ordering::SeqCst);
            return Err(injected("subscribe"));
        }
        let inner = self.inner.subscribe(channels).await?;
        Ok(Box::new(FaultySubscription {
            inner,
            plan: self.plan.clone(),
        }))
    }
}

struct FaultySubscription {
    inner: Box<dyn Subscription>,
    plan: Arc<FaultPlan>,
}

#[async_trait::async_trait]
impl Subscription for FaultySubscription {
    async fn receive(&mut self, timeout: Duration) -> CoordResult<Option<PubSubMessage>> {
        if FaultPlan::active(&self.plan.fail_receive) {
            return Err(injected("receive"));
        }
        self.inner.receive(timeout).await
    }

    async fn unsubscribe(&mut self) -> CoordResult<()> {
        self.inner.unsubscribe().await
    }

    async fn close(&mut self) -> CoordResult<()> {
        if FaultPlan::active(&self.plan.fail_close) {
            return Err(injected("close"));
        }
        self.inner.close().await
    }
}
