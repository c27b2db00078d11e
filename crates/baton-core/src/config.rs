use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;

/// Tunables for one worker instance. Every field has a default, so any layer
/// may name only the fields it changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub instance_id: String,
    pub lock_ttl_secs: u64,
    pub liveness_ttl_secs: u64,
    pub response_retention_secs: u64,
    pub control_poll_timeout_ms: u64,
    pub control_poll_sleep_ms: u64,
    pub liveness_refresh_every: u64,
    pub subscribe_attempts: u32,
    pub drain_timeout_ms: u64,
    pub write_queue_capacity: usize,
    pub status_attempts: u32,
    pub status_backoff_ms: u64,
    pub max_concurrent_runs: usize,
    pub log_retention_days: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            instance_id: new_instance_id(),
            lock_ttl_secs: 3600,
            liveness_ttl_secs: 3600,
            response_retention_secs: 24 * 60 * 60,
            control_poll_timeout_ms: 500,
            control_poll_sleep_ms: 100,
            liveness_refresh_every: 50,
            subscribe_attempts: 3,
            drain_timeout_ms: 30_000,
            write_queue_capacity: 1024,
            status_attempts: 3,
            status_backoff_ms: 500,
            max_concurrent_runs: 4,
            log_retention_days: 14,
        }
    }
}

impl WorkerConfig {
    /// Layers, lowest precedence first: defaults, JSON file, `BATON_*`
    /// environment, CLI overrides. A missing file is an empty layer.
    pub async fn load(file: Option<&Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let file_layer = match file {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        let env_layer = env_layer(std::env::vars())?;
        Self::from_layers(&[file_layer, env_layer, cli_overrides.unwrap_or_else(empty_object)])
    }

    pub fn from_layers(layers: &[Value]) -> anyhow::Result<Self> {
        let mut merged =
            serde_json::to_value(Self::default()).context("serialize default worker config")?;
        for layer in layers {
            deep_merge(&mut merged, layer);
        }
        let config: Self =
            serde_json::from_value(merged).context("invalid worker configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.instance_id.trim().is_empty() {
            bail!("instance_id must not be empty");
        }
        if self.instance_id.contains(':') {
            bail!("instance_id must not contain ':' (used as a key separator)");
        }
        // a zero TTL expires on write
        for (field, value) in [
            ("lock_ttl_secs", self.lock_ttl_secs),
            ("liveness_ttl_secs", self.liveness_ttl_secs),
            ("response_retention_secs", self.response_retention_secs),
            ("drain_timeout_ms", self.drain_timeout_ms),
            ("control_poll_timeout_ms", self.control_poll_timeout_ms),
        ] {
            if value == 0 {
                bail!("{field} must be greater than zero");
            }
        }
        if self.liveness_refresh_every == 0 {
            bail!("liveness_refresh_every must be at least 1");
        }
        if self.subscribe_attempts == 0 || self.status_attempts == 0 {
            bail!("retry attempt counts must be at least 1");
        }
        if self.write_queue_capacity == 0 || self.max_concurrent_runs == 0 {
            bail!("write_queue_capacity and max_concurrent_runs must be at least 1");
        }
        Ok(())
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn liveness_ttl(&self) -> Duration {
        Duration::from_secs(self.liveness_ttl_secs)
    }

    pub fn response_retention(&self) -> Duration {
        Duration::from_secs(self.response_retention_secs)
    }

    pub fn control_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.control_poll_timeout_ms)
    }

    pub fn control_poll_sleep(&self) -> Duration {
        Duration::from_millis(self.control_poll_sleep_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn status_backoff(&self) -> Duration {
        Duration::from_millis(self.status_backoff_ms)
    }
}

pub fn new_instance_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("read config file {}", path.display()))?;
    serde_json::from_str::<Value>(&raw)
        .with_context(|| format!("parse config file {}", path.display()))
}

const ENV_STRING_KEYS: &[(&str, &str)] = &[("BATON_INSTANCE_ID", "instance_id")];

const ENV_NUMBER_KEYS: &[(&str, &str)] = &[
    ("BATON_LOCK_TTL_SECS", "lock_ttl_secs"),
    ("BATON_LIVENESS_TTL_SECS", "liveness_ttl_secs"),
    ("BATON_RESPONSE_RETENTION_SECS", "response_retention_secs"),
    ("BATON_CONTROL_POLL_TIMEOUT_MS", "control_poll_timeout_ms"),
    ("BATON_CONTROL_POLL_SLEEP_MS", "control_poll_sleep_ms"),
    ("BATON_LIVENESS_REFRESH_EVERY", "liveness_refresh_every"),
    ("BATON_SUBSCRIBE_ATTEMPTS", "subscribe_attempts"),
    ("BATON_DRAIN_TIMEOUT_MS", "drain_timeout_ms"),
    ("BATON_WRITE_QUEUE_CAPACITY", "write_queue_capacity"),
    ("BATON_STATUS_ATTEMPTS", "status_attempts"),
    ("BATON_STATUS_BACKOFF_MS", "status_backoff_ms"),
    ("BATON_MAX_CONCURRENT_RUNS", "max_concurrent_runs"),
    ("BATON_LOG_RETENTION_DAYS", "log_retention_days"),
];

fn env_layer(vars: impl IntoIterator<Item = (String, String)>) -> anyhow::Result<Value> {
    let mut root = Map::new();
    for (name, raw) in vars {
        if raw.trim().is_empty() {
            continue;
        }
        if let Some((_, field)) = ENV_STRING_KEYS.iter().find(|(env, _)| *env == name) {
            root.insert(field.to_string(), Value::from(raw.trim()));
            continue;
        }
        if let Some((_, field)) = ENV_NUMBER_KEYS.iter().find(|(env, _)| *env == name) {
            let value = raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{name} must be a non-negative integer, got `{raw}`"))?;
            root.insert(field.to_string(), Value::from(value));
        }
    }
    Ok(Value::Object(root))
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
