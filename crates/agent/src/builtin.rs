//! Handlers an agent can enable by name from `agent.taskTypes` / `agent.capabilities`.

use async_trait::async_trait;
use chrono::Utc;
use meshcell_core::{Error, Result, Task};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::handler::{CapabilityHandler, TaskContext, TaskHandler};

/// Upper bound for the `delay` handler.
const MAX_DELAY_MS: u64 = 60_000;

pub fn task_handler(name: &str) -> Option<Arc<dyn TaskHandler>> {
    match name {
        "echo" => Some(Arc::new(EchoHandler)),
        "uppercase" => Some(Arc::new(UppercaseHandler)),
        "delay" => Some(Arc::new(DelayHandler)),
        _ => None,
    }
}

pub fn capability_handler(name: &str) -> Option<Arc<dyn CapabilityHandler>> {
    match name {
        "echo" => Some(Arc::new(EchoCapability)),
        "time" => Some(Arc::new(TimeCapability)),
        _ => None,
    }
}

/// Returns the payload unchanged.
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    fn task_type(&self) -> &str {
        "echo"
    }

    async fn handle(&self, task: &Task, _ctx: &TaskContext) -> Result<Value> {
        Ok(task.payload.clone())
    }
}

/// Uppercases a string payload, or the `text` field of an object payload.
pub struct UppercaseHandler;

#[async_trait]
impl TaskHandler for UppercaseHandler {
    fn task_type(&self) -> &str {
        "uppercase"
    }

    async fn handle(&self, task: &Task, _ctx: &TaskContext) -> Result<Value> {
        match &task.payload {
            Value::String(s) => Ok(Value::String(s.to_uppercase())),
            Value::Object(map) => match map.get("text").and_then(|v| v.as_str()) {
                Some(text) => Ok(json!({ "text": text.to_uppercase() })),
                None => Err(Error::Processing("payload object has no 'text' string".to_string())),
            },
            _ => Err(Error::Processing("uppercase expects a string payload".to_string())),
        }
    }
}

/// Sleeps for `{"ms": n}` milliseconds.
pub struct DelayHandler;

#[async_trait]
impl TaskHandler for DelayHandler {
    fn task_type(&self) -> &str {
        "delay"
    }

    async fn handle(&self, task: &Task, _ctx: &TaskContext) -> Result<Value> {
        let ms = task
            .payload
            .get("ms")
            .and_then(|v| v.as_u64())
            .or_else(|| task.payload.as_u64())
            .ok_or_else(|| Error::Processing("delay expects {\"ms\": <number>}".to_string()))?
            .min(MAX_DELAY_MS);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "sleptMs": ms }))
    }
}

pub struct EchoCapability;

#[async_trait]
impl CapabilityHandler for EchoCapability {
    fn capability(&self) -> &str {
        "echo"
    }

    async fn invoke(&self, parameters: &Value, _ctx: &TaskContext) -> Result<Value> {
        Ok(parameters.clone())
    }
}

pub struct TimeCapability;

#[async_trait]
impl CapabilityHandler for TimeCapability {
    fn capability(&self) -> &str {
        "time"
    }

    async fn invoke(&self, _parameters: &Value, ctx: &TaskContext) -> Result<Value> {
        Ok(json!({
            "now": Utc::now().to_rfc3339(),
            "agentId": ctx.agent_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcell_bus::MemoryBus;

    fn ctx() -> TaskContext {
        TaskContext {
            agent_id: "agent-a".to_string(),
            bus: Arc::new(MemoryBus::new()),
        }
    }

    #[tokio::test]
    async fn test_uppercase_string_and_object() {
        let handler = UppercaseHandler;
        let out = handler.handle(&Task::new("uppercase", json!("hi")), &ctx()).await.unwrap();
        assert_eq!(out, json!("HI"));
        let out = handler
            .handle(&Task::new("uppercase", json!({"text": "abc"})), &ctx())
            .await
            .unwrap();
        assert_eq!(out, json!({"text": "ABC"}));
        assert!(handler.handle(&Task::new("uppercase", json!(3)), &ctx()).await.is_err());
    }

    #[tokio::test]
    async fn test_delay_reports_sleep() {
        let out = DelayHandler
            .handle(&Task::new("delay", json!({"ms": 5})), &ctx())
            .await
            .unwrap();
        assert_eq!(out["sleptMs"], 5);
    }

    #[test]
    fn test_lookup_by_name() {
        assert!(task_handler("echo").is_some());
        assert!(task_handler("summarize").is_none());
        assert_eq!(capability_handler("time").unwrap().capability(), "time");
    }
}
