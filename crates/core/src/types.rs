use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// Roster status of an agent as seen by the directory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Online => write!(f, "online"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Directory record for one agent. Keyed by `id`; never duplicated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub task_types: BTreeSet<String>,
    pub status: AgentStatus,
    pub last_seen_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    /// Last heartbeat status reported, if any heartbeat was seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<HeartbeatStatus>,
    #[serde(default)]
    pub uptime_ms: u64,
    #[serde(default)]
    pub tasks_processed: u64,
}

/// `agent.announce` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Announce {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub task_types: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    Alive,
    Stopping,
    Restarting,
}

impl std::fmt::Display for HeartbeatStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeartbeatStatus::Alive => write!(f, "alive"),
            HeartbeatStatus::Stopping => write!(f, "stopping"),
            HeartbeatStatus::Restarting => write!(f, "restarting"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub agent_id: String,
    pub status: HeartbeatStatus,
    pub uptime_ms: u64,
    pub tasks_processed: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A unit of work published to `tasks.<type>`. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    /// Opaque to the coordination layer. Accepts `data` as an alias on input.
    #[serde(default, alias = "data")]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Task {
    pub fn new(task_type: &str, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_type: task_type.to_string(),
            payload,
            priority: TaskPriority::Normal,
            created_at: Utc::now(),
            timeout_ms: None,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Decode and validate a task message: non-empty `id` and `type`, non-null payload.
    pub fn parse(value: serde_json::Value) -> Result<Self> {
        let task: Task = serde_json::from_value(value)
            .map_err(|e| Error::Validation(format!("malformed task: {}", e)))?;
        task.validate()?;
        Ok(task)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("task id is empty".to_string()));
        }
        if self.task_type.trim().is_empty() {
            return Err(Error::Validation(format!("task {} has an empty type", self.id)));
        }
        if self.payload.is_null() {
            return Err(Error::Validation(format!("task {} has no payload", self.id)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskResultStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for TaskResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskResultStatus::Completed => write!(f, "completed"),
            TaskResultStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of one agent processing one task, published to `task.result`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub agent_id: String,
    pub task_id: String,
    pub status: TaskResultStatus,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub processing_time_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn completed(
        agent_id: &str,
        task_id: &str,
        payload: serde_json::Value,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            status: TaskResultStatus::Completed,
            payload,
            error: None,
            processing_time_ms,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(agent_id: &str, task_id: &str, error: &str, processing_time_ms: u64) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            status: TaskResultStatus::Failed,
            payload: serde_json::Value::Null,
            error: Some(error.to_string()),
            processing_time_ms,
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskResultStatus::Completed
    }
}

/// Filter for `directory.list`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryFilter {
    #[default]
    All,
    Online,
    Offline,
}

impl DirectoryFilter {
    pub fn accepts(&self, status: AgentStatus) -> bool {
        match self {
            DirectoryFilter::All => true,
            DirectoryFilter::Online => status == AgentStatus::Online,
            DirectoryFilter::Offline => status == AgentStatus::Offline,
        }
    }
}

impl std::str::FromStr for DirectoryFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(DirectoryFilter::All),
            "online" => Ok(DirectoryFilter::Online),
            "offline" => Ok(DirectoryFilter::Offline),
            other => Err(Error::Validation(format!("unknown directory filter '{}'", other))),
        }
    }
}
