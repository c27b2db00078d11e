//! Coordination store seam: atomic key-value primitives with per-key TTL,
//! append-only lists and pub/sub channels.

mod fault;
mod memory;

use std::time::Duration;

pub use fault::{FaultPlan, FaultyStore};
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    #[error("coordination store transport error: {0}")]
    Transport(String),

    #[error("wrong value type for key `{0}`")]
    WrongType(String),

    #[error("subscription closed")]
    SubscriptionClosed,
}

pub type CoordResult<T> = Result<T, CoordError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub if_not_exists: bool,
    pub ttl: Option<Duration>,
}

impl SetOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            if_not_exists: false,
            ttl: Some(ttl),
        }
    }

    pub fn if_absent_with_ttl(ttl: Duration) -> Self {
        Self {
            if_not_exists: true,
            ttl: Some(ttl),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubMessage {
    /// Subscription-management confirmation; carries no application data.
    Subscribed { channel: String },
    Message { channel: String, payload: String },
}

impl PubSubMessage {
    pub fn payload(&self) -> Option<&str> {
        match self {
            PubSubMessage::Message { payload, .. } => Some(payload),
            PubSubMessage::Subscribed { .. } => None,
        }
    }
}

#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Returns `false` when `if_not_exists` is set and the key is already live.
    async fn set(&self, key: &str, value: &str, options: SetOptions) -> CoordResult<bool>;

    async fn get(&self, key: &str) -> CoordResult<Option<String>>;

    async fn delete(&self, key: &str) -> CoordResult<()>;

    /// No-op when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> CoordResult<()>;

    async fn list_append(&self, key: &str, value: &str) -> CoordResult<()>;

    /// Inclusive range; negative indices count from the end (`-1` is the last element).
    async fn list_range(&self, key: &str, start: i64, end: i64) -> CoordResult<Vec<String>>;

    async fn publish(&self, channel: &str, message: &str) -> CoordResult<()>;

    async fn subscribe(&self, channels: &[String]) -> CoordResult<Box<dyn Subscription>>;
}

#[async_trait::async_trait]
pub trait Subscription: Send {
    /// Waits at most `timeout`; `Ok(None)` means nothing arrived in time.
    async fn receive(&mut self, timeout: Duration) -> CoordResult<Option<PubSubMessage>>;

    async fn unsubscribe(&mut self) -> CoordResult<()>;

    async fn close(&mut self) -> CoordResult<()>;
}
