use meshcell_bus::Bus;
use meshcell_core::{topics, Agent, DirectoryFilter, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Queries the directory over request/reply. A silent directory yields an
/// empty list or `None`, never an error.
#[derive(Clone)]
pub struct DirectoryClient {
    bus: Arc<dyn Bus>,
    timeout: Duration,
}

impl DirectoryClient {
    pub fn new(bus: Arc<dyn Bus>, timeout: Duration) -> Self {
        Self { bus, timeout }
    }

    pub async fn list(&self, filter: DirectoryFilter) -> Result<Vec<Agent>> {
        match self
            .bus
            .request(topics::DIRECTORY_LIST, json!({ "filter": filter }), self.timeout)
            .await
        {
            Ok(reply) => reply.decode(),
            Err(e) if e.is_timeout() => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "Directory did not answer, returning empty list");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Agent>> {
        match self
            .bus
            .request(topics::DIRECTORY_GET, json!({ "id": id }), self.timeout)
            .await
        {
            Ok(reply) => reply.decode(),
            Err(e) if e.is_timeout() => {
                warn!(agent_id = %id, "Directory did not answer");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcell_bus::MemoryBus;

    #[tokio::test]
    async fn test_silent_directory_gives_empty_outcomes() {
        let client = DirectoryClient::new(Arc::new(MemoryBus::new()), Duration::from_millis(30));
        assert!(client.list(DirectoryFilter::All).await.unwrap().is_empty());
        assert!(client.get("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_sends_filter() {
        let bus = MemoryBus::new();
        let mut requests = bus.subscribe(topics::DIRECTORY_LIST).await.unwrap();
        let responder = bus.clone();
        tokio::spawn(async move {
            let msg = requests.recv().await.unwrap();
            assert_eq!(msg.payload["filter"], "offline");
            responder.reply(&msg, json!([])).await.unwrap();
        });
        let client = DirectoryClient::new(Arc::new(bus), Duration::from_secs(1));
        assert!(client.list(DirectoryFilter::Offline).await.unwrap().is_empty());
    }
}
