use async_trait::async_trait;
use meshcell_bus::Bus;
use meshcell_core::{Result, Task};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// What a handler sees of the agent running it.
#[derive(Clone)]
pub struct TaskContext {
    pub agent_id: String,
    pub bus: Arc<dyn Bus>,
}

/// Executes tasks of one type (`tasks.<type>`).
///
/// An `Err` becomes a `failed` TaskResult carrying the error string; so does a panic.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> &str;

    async fn handle(&self, task: &Task, ctx: &TaskContext) -> Result<Value>;
}

/// Answers capability requests dispatched by the broker.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    fn capability(&self) -> &str;

    async fn invoke(&self, parameters: &Value, ctx: &TaskContext) -> Result<Value>;
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        let task_type = handler.task_type().to_string();
        if self.handlers.insert(task_type.clone(), handler).is_some() {
            warn!(task_type = %task_type, "Replacing existing task handler");
        }
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    handlers: HashMap<String, Arc<dyn CapabilityHandler>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn CapabilityHandler>) {
        let capability = handler.capability().to_string();
        if self.handlers.insert(capability.clone(), handler).is_some() {
            warn!(capability = %capability, "Replacing existing capability handler");
        }
    }

    pub fn get(&self, capability: &str) -> Option<Arc<dyn CapabilityHandler>> {
        self.handlers.get(capability).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
