use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use baton_types::{ResponseEvent, RunRequest};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Finite, non-restartable sequence of engine events. An `Err` item is an
/// engine fault and ends the run as failed.
pub type EventStream = BoxStream<'static, anyhow::Result<ResponseEvent>>;

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// `cancel` fires once the run has been asked to stop; engines may use it
    /// to abandon in-flight work early.
    async fn start(&self, request: &RunRequest, cancel: CancellationToken)
        -> anyhow::Result<EventStream>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Emit(ResponseEvent),
    Delay(Duration),
    Fail(String),
    Panic(String),
}

/// Replays a fixed script. Used by the CLI and by tests.
///
/// Script format is JSON lines: an event object (must carry `type`),
/// `{"delay_ms": n}`, `{"fail": "message"}` or `{"panic": "message"}`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    steps: Vec<ScriptStep>,
}

impl ScriptedEngine {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self { steps }
    }

    pub fn from_events(events: impl IntoIterator<Item = ResponseEvent>) -> Self {
        Self::new(events.into_iter().map(ScriptStep::Emit).collect())
    }

    pub fn from_jsonl(raw: &str) -> anyhow::Result<Self> {
        let mut steps = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line)
                .with_context(|| format!("script line {}: invalid JSON", idx + 1))?;
            steps.push(
                parse_step(value).with_context(|| format!("script line {}", idx + 1))?,
            );
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[ScriptStep] {
        &self.steps
    }
}

fn parse_step(value: Value) -> anyhow::Result<ScriptStep> {
    let Value::Object(map) = value else {
        return Err(anyhow!("expected a JSON object"));
    };
    if map.len() == 1 {
        if let Some(ms) = map.get("delay_ms") {
            let ms = ms
                .as_u64()
                .ok_or_else(|| anyhow!("delay_ms must be a non-negative integer"))?;
            return Ok(ScriptStep::Delay(Duration::from_millis(ms)));
        }
        if let Some(message) = map.get("fail").and_then(Value::as_str) {
            return Ok(ScriptStep::Fail(message.to_string()));
        }
        if let Some(message) = map.get("panic").and_then(Value::as_str) {
            return Ok(ScriptStep::Panic(message.to_string()));
        }
    }
    if !map.get("type").is_some_and(Value::is_string) {
        return Err(anyhow!("event is missing a string `type`"));
    }
    let event: ResponseEvent = serde_json::from_value(Value::Object(map))?;
    Ok(ScriptStep::Emit(event))
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    async fn start(
        &self,
        request: &RunRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<EventStream> {
        tracing::debug!(run_id = %request.run_id, steps = self.steps.len(), "starting scripted run");
        let steps = self.steps.clone().into_iter();
        let events = stream::unfold((steps, cancel), |(mut steps, cancel)| async move {
            loop {
                match steps.next()? {
                    ScriptStep::Emit(event) => return Some((Ok(event), (steps, cancel))),
                    ScriptStep::Delay(delay) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return None,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    ScriptStep::Fail(message) => {
                        return Some((Err(anyhow!(message)), (steps, cancel)));
                    }
                    ScriptStep::Panic(message) => panic!("{message}"),
                }
            }
        });
        Ok(events.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_types::RunStatus;

    #[test]
    fn jsonl_script_parses_every_step_kind() {
        let engine = ScriptedEngine::from_jsonl(
            r#"
            {"type":"assistant","content":"hi"}
            {"delay_ms": 25}

            {"fail": "boom"}
            {"panic": "kaboom"}
            {"type":"status","status":"completed"}
            "#,
        )
        .expect("parse");
        let steps = engine.steps();
        assert_eq!(steps.len(), 5);
        assert!(matches!(&steps[0], ScriptStep::Emit(e) if e.event_type == "assistant"));
        assert_eq!(steps[1], ScriptStep::Delay(Duration::from_millis(25)));
        assert_eq!(steps[2], ScriptStep::Fail("boom".to_string()));
        assert_eq!(steps[3], ScriptStep::Panic("kaboom".to_string()));
        assert!(
            matches!(&steps[4], ScriptStep::Emit(e) if e.terminal_status() == Some(RunStatus::Completed))
        );
    }

    #[test]
    fn script_errors_name_the_line() {
        let err = ScriptedEngine::from_jsonl("{\"type\":\"a\"}\n{\"content\":1}").unwrap_err();
        assert!(format!("{err:#}").contains("script line 2"));
        let err = ScriptedEngine::from_jsonl("not json").unwrap_err();
        assert!(format!("{err:#}").contains("script line 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn stream_replays_events_and_faults_in_order() {
        let engine = ScriptedEngine::new(vec![
            ScriptStep::Emit(ResponseEvent::new("a", Value::Null)),
            ScriptStep::Delay(Duration::from_secs(5)),
            ScriptStep::Fail("boom".to_string()),
        ]);
        let mut events = engine
            .start(&RunRequest::new("r1"), CancellationToken::new())
            .await
            .expect("start");
        assert_eq!(events.next().await.expect("first").expect("ok").event_type, "a");
        let fault = events.next().await.expect("second").unwrap_err();
        assert_eq!(fault.to_string(), "boom");
        assert!(events.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_delay() {
        let engine = ScriptedEngine::new(vec![
            ScriptStep::Delay(Duration::from_secs(3600)),
            ScriptStep::Emit(ResponseEvent::new("late", Value::Null)),
        ]);
        let cancel = CancellationToken::new();
        let mut events = engine
            .start(&RunRequest::new("r1"), cancel.clone())
            .await
            .expect("start");
        cancel.cancel();
        assert!(events.next().await.is_none());
    }
}
