use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::{CoordError, CoordResult, CoordinationStore, PubSubMessage, SetOptions, Subscription};

#[derive(Debug, Clone)]
enum Stored {
    Text(String),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

type SubscriberList = Vec<(u64, mpsc::UnboundedSender<PubSubMessage>)>;

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, SubscriberList>>,
    next_subscription: AtomicU64,
}

impl Inner {
    fn deregister(&self, subscription_id: u64) {
        let mut channels = self.channels.lock();
        for subscribers in channels.values_mut() {
            subscribers.retain(|(id, _)| *id != subscription_id);
        }
        channels.retain(|_, subscribers| !subscribers.is_empty());
    }
}

/// In-process coordination store with Redis-like semantics.
///
/// TTLs are measured on the tokio clock, so tests can drive expiry with
/// `tokio::time::pause` and `advance`. Expired keys are purged lazily on access.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining time-to-live; `None` for missing keys and keys without expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut entries = self.inner.entries.lock();
        let entry = live_entry(&mut entries, key, now)?;
        entry.expires_at.map(|at| at.saturating_duration_since(now))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let mut entries = self.inner.entries.lock();
        live_entry(&mut entries, key, Instant::now()).is_some()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

fn live_entry<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn resolve_range(len: usize, start: i64, end: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let end = if end < 0 { len + end } else { end.min(len - 1) };
    if start > end || start >= len || end < 0 {
        return None;
    }
    Some((start as usize, end as usize))
}

#[async_trait::async_trait]
impl CoordinationStore for MemoryStore {
    async fn set(&self, key: &str, value: &str, options: SetOptions) -> CoordResult<bool> {
        let now = Instant::now();
        let mut entries = self.inner.entries.lock();
        if options.if_not_exists && live_entry(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Stored::Text(value.to_string()),
                expires_at: options.ttl.map(|ttl| now + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> CoordResult<Option<String>> {
        let mut entries = self.inner.entries.lock();
        match live_entry(&mut entries, key, Instant::now()) {
            None => Ok(None),
            Some(Entry {
                value: Stored::Text(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(CoordError::WrongType(key.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> CoordResult<()> {
        self.inner.entries.lock().remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CoordResult<()> {
        let now = Instant::now();
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = live_entry(&mut entries, key, now) {
            entry.expires_at = Some(now + ttl);
        }
        Ok(())
    }

    async fn list_append(&self, key: &str, value: &str) -> CoordResult<()> {
        let now = Instant::now();
        let mut entries = self.inner.entries.lock();
        match live_entry(&mut entries, key, now) {
            Some(Entry {
                value: Stored::List(items),
                ..
            }) => {
                items.push(value.to_string());
                Ok(())
            }
            Some(_) => Err(CoordError::WrongType(key.to_string())),
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Stored::List(vec![value.to_string()]),
                        expires_at: None,
                    },
                );
                Ok(())
            }
        }
    }

    async fn list_range(&self, key: &str, start: i64, end: i64) -> CoordResult<Vec<String>> {
        let mut entries = self.inner.entries.lock();
        match live_entry(&mut entries, key, Instant::now()) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Stored::List(items),
                ..
            }) => Ok(resolve_range(items.len(), start, end)
                .map(|(from, to)| items[from..=to].to_vec())
                .unwrap_or_default()),
            Some(_) => Err(CoordError::WrongType(key.to_string())),
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> CoordResult<()> {
        let mut channels = self.inner.channels.lock();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|(_, tx)| {
                tx.send(PubSubMessage::Message {
                    channel: channel.to_string(),
                    payload: message.to_string(),
                })
                .is_ok()
            });
        }
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> CoordResult<Box<dyn Subscription>> {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut registry = self.inner.channels.lock();
            for channel in channels {
                registry
                    .entry(channel.clone())
                    .or_default()
                    .push((id, tx.clone()));
                let _ = tx.send(PubSubMessage::Subscribed {
                    channel: channel.clone(),
                });
            }
        }
        Ok(Box::new(MemorySubscription {
            id,
            rx,
            inner: self.inner.clone(),
            closed: false,
        }))
    }
}

struct MemorySubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<PubSubMessage>,
    inner: Arc<Inner>,
    closed: bool,
}

#[async_trait::async_trait]
impl Subscription for MemorySubscription {
    async fn receive(&mut self, timeout: Duration) -> CoordResult<Option<PubSubMessage>> {
        if self.closed {
            return Err(CoordError::SubscriptionClosed);
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(message) => Ok(message),
            Err(_) => Ok(None),
        }
    }

    async fn unsubscribe(&mut self) -> CoordResult<()> {
        self.inner.deregister(self.id);
        Ok(())
    }

    async fn close(&mut self) -> CoordResult<()> {
        self.inner.deregister(self.id);
        self.rx.close();
        self.closed = true;
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.inner.deregister(self.id);
    }
}
