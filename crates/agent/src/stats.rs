use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

use crate::state::AgentState;

/// Local execution counters for one agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Running mean over every processed task.
    pub average_latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_task_at: Option<DateTime<Utc>>,
}

impl TaskStats {
    pub fn record(&mut self, success: bool, latency_ms: u64) {
        self.processed += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.average_latency_ms += (latency_ms as f64 - self.average_latency_ms) / self.processed as f64;
        self.last_task_at = Some(Utc::now());
    }
}

/// Shared handle to the counters, updated by task executions and read by heartbeats.
#[derive(Clone, Default)]
pub struct StatsHandle {
    inner: Arc<Mutex<TaskStats>>,
}

impl StatsHandle {
    pub fn record(&self, success: bool, latency_ms: u64) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(success, latency_ms);
    }

    pub fn snapshot(&self) -> TaskStats {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn processed(&self) -> u64 {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).processed
    }
}

/// Reply to a `status`/`ping` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusReport {
    pub agent_id: String,
    pub display_name: String,
    pub state: AgentState,
    pub uptime_ms: u64,
    pub capabilities: Vec<String>,
    pub task_types: Vec<String>,
    pub stats: TaskStats,
    pub timestamp: DateTime<Utc>,
}
