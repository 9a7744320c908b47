use meshcell_bus::{Bus, Subscription};
use meshcell_core::{topics, Result, Task, TaskResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Publishes tasks to `tasks.<type>`. Every subscribed agent that handles the
/// type runs it, so one task can yield several results.
#[derive(Clone)]
pub struct TaskPublisher {
    bus: Arc<dyn Bus>,
}

impl TaskPublisher {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    pub async fn publish(&self, task: &Task) -> Result<()> {
        task.validate()?;
        self.bus
            .publish(&topics::tasks(&task.task_type), serde_json::to_value(task)?)
            .await?;
        debug!(task_id = %task.id, task_type = %task.task_type, "Task published");
        Ok(())
    }

    /// Watch `task.result` for one task id.
    pub async fn watch(&self, task_id: &str) -> Result<ResultWatcher> {
        let subscription = self.bus.subscribe(topics::TASK_RESULT).await?;
        Ok(ResultWatcher::for_task(subscription, task_id))
    }

    /// Publish and collect the matching results, stopping at `expected` results
    /// (0 = no limit) or when `timeout` runs out.
    pub async fn dispatch(&self, task: &Task, expected: usize, timeout: Duration) -> Result<Vec<TaskResult>> {
        // Subscribe first so fast agents cannot answer before we listen.
        let mut watcher = self.watch(&task.id).await?;
        self.publish(task).await?;
        Ok(watcher.collect(expected, timeout).await)
    }
}

/// Filters the shared result topic, optionally down to one task id.
pub struct ResultWatcher {
    subscription: Subscription,
    task_id: Option<String>,
}

impl ResultWatcher {
    pub fn all(subscription: Subscription) -> Self {
        Self {
            subscription,
            task_id: None,
        }
    }

    pub fn for_task(subscription: Subscription, task_id: &str) -> Self {
        Self {
            subscription,
            task_id: Some(task_id.to_string()),
        }
    }

    /// Next matching result; `None` once the subscription closes.
    pub async fn next(&mut self) -> Option<TaskResult> {
        loop {
            let message = self.subscription.recv().await?;
            let result: TaskResult = match message.decode() {
                Ok(result) => result,
                Err(e) => {
                    debug!(error = %e, "Skipping malformed task result");
                    continue;
                }
            };
            match &self.task_id {
                Some(id) if *id != result.task_id => continue,
                _ => return Some(result),
            }
        }
    }

    pub async fn collect(&mut self, expected: usize, timeout: Duration) -> Vec<TaskResult> {
        let deadline = Instant::now() + timeout;
        let mut results = Vec::new();
        while expected == 0 || results.len() < expected {
            match tokio::time::timeout_at(deadline, self.next()).await {
                Ok(Some(result)) => results.push(result),
                Ok(None) | Err(_) => break,
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcell_bus::MemoryBus;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_rejects_invalid_task() {
        let publisher = TaskPublisher::new(Arc::new(MemoryBus::new()));
        assert!(publisher.publish(&Task::new("echo", json!(null))).await.is_err());
    }

    #[tokio::test]
    async fn test_watcher_filters_by_task_id() {
        let bus = MemoryBus::new();
        let publisher = TaskPublisher::new(Arc::new(bus.clone()));
        let mut watcher = publisher.watch("t1").await.unwrap();

        for (agent, task) in [("a1", "t0"), ("a1", "t1"), ("a2", "t1")] {
            let result = TaskResult::completed(agent, task, json!(null), 1);
            bus.publish(topics::TASK_RESULT, serde_json::to_value(&result).unwrap())
                .await
                .unwrap();
        }
        bus.publish(topics::TASK_RESULT, json!("noise")).await.unwrap();

        let results = watcher.collect(0, Duration::from_millis(50)).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.task_id == "t1"));
        assert_eq!(results[0].agent_id, "a1");
        assert_eq!(results[1].agent_id, "a2");
    }
}
