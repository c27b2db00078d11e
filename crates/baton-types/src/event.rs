use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::RunStatus;

pub const STATUS_EVENT_TYPE: &str = "status";

/// One record produced by the execution engine and stored in the response log.
///
/// Only `type` is interpreted; every other field is carried through verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ResponseEvent {
    pub fn new(event_type: impl Into<String>, fields: Value) -> Self {
        let fields = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("content".to_string(), other);
                map
            }
        };
        Self {
            event_type: event_type.into(),
            fields,
        }
    }

    pub fn status(status: RunStatus, message: Option<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(
            "status".to_string(),
            Value::String(status.as_str().to_string()),
        );
        if let Some(message) = message {
            fields.insert("message".to_string(), Value::String(message));
        }
        Self {
            event_type: STATUS_EVENT_TYPE.to_string(),
            fields,
        }
    }

    pub fn is_status(&self) -> bool {
        self.event_type == STATUS_EVENT_TYPE
    }

    pub fn status_value(&self) -> Option<&str> {
        if !self.is_status() {
            return None;
        }
        self.fields.get("status").and_then(|v| v.as_str())
    }

    pub fn message(&self) -> Option<&str> {
        self.fields.get("message").and_then(|v| v.as_str())
    }

    /// `Some` only for status records whose status ends the run.
    pub fn terminal_status(&self) -> Option<RunStatus> {
        let status = self.status_value()?.parse::<RunStatus>().ok()?;
        status.is_terminal().then_some(status)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}
