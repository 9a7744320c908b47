use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Recipient value meaning "every agent".
pub const ALL_AGENTS: &str = "all";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Command,
    Query,
    Response,
}

/// Point-to-point or broadcast wrapper for direct agent messaging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub from: String,
    /// An agent id, or `"all"`.
    pub to: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn new(from: &str, to: &str, kind: MessageKind, content: serde_json::Value) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            kind,
            content,
            metadata: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == ALL_AGENTS
    }
}

/// Payload of `agent.<id>.events`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl AgentEvent {
    pub fn new(event_type: &str, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
        }
    }

    pub fn parse(value: serde_json::Value) -> Result<Self> {
        let event: AgentEvent = serde_json::from_value(value)
            .map_err(|e| Error::Validation(format!("malformed agent event: {}", e)))?;
        if event.event_type.trim().is_empty() {
            return Err(Error::Validation("agent event has an empty type".to_string()));
        }
        Ok(event)
    }
}

/// Payload of the `broadcast` topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub message: serde_json::Value,
}

impl BroadcastMessage {
    pub fn new(message_type: &str, message: serde_json::Value) -> Self {
        Self {
            message_type: message_type.to_string(),
            message,
        }
    }

    pub fn parse(value: serde_json::Value) -> Result<Self> {
        let msg: BroadcastMessage = serde_json::from_value(value)
            .map_err(|e| Error::Validation(format!("malformed broadcast: {}", e)))?;
        if msg.message_type.trim().is_empty() {
            return Err(Error::Validation("broadcast has an empty type".to_string()));
        }
        Ok(msg)
    }
}
