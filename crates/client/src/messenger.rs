use meshcell_bus::Bus;
use meshcell_core::{
    topics, AgentEvent, BroadcastMessage, Error, MessageEnvelope, MessageKind, Result,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Direct agent messaging: envelopes, agent events and broadcasts.
#[derive(Clone)]
pub struct Messenger {
    bus: Arc<dyn Bus>,
    from: String,
}

impl Messenger {
    pub fn new(bus: Arc<dyn Bus>, from: &str) -> Self {
        Self {
            bus,
            from: from.to_string(),
        }
    }

    /// Send an envelope to one agent (as a `message` event) or to `all`
    /// (as a `message` broadcast).
    pub async fn send(&self, to: &str, kind: MessageKind, content: Value) -> Result<MessageEnvelope> {
        let envelope = MessageEnvelope::new(&self.from, to, kind, content);
        let payload = serde_json::to_value(&envelope)?;
        if envelope.is_broadcast() {
            self.broadcast("message", payload).await?;
        } else {
            self.event(to, "message", payload).await?;
        }
        Ok(envelope)
    }

    pub async fn event(&self, agent_id: &str, event_type: &str, data: Value) -> Result<()> {
        if !topics::is_valid_token(agent_id) {
            return Err(Error::Validation(format!("invalid agent id '{}'", agent_id)));
        }
        let event = AgentEvent::new(event_type, data);
        self.bus
            .publish(&topics::events(agent_id), serde_json::to_value(&event)?)
            .await
    }

    pub async fn broadcast(&self, message_type: &str, message: Value) -> Result<()> {
        let broadcast = BroadcastMessage::new(message_type, message);
        self.bus
            .publish(topics::BROADCAST, serde_json::to_value(&broadcast)?)
            .await
    }

    /// Ask one agent for its status report. `None` if it does not answer in time.
    pub async fn status(&self, agent_id: &str, timeout: Duration) -> Result<Option<Value>> {
        self.ask(agent_id, "status", Value::Null, timeout).await
    }

    /// Send an event on the request/reply path and wait for the agent's answer.
    pub async fn ask(
        &self,
        agent_id: &str,
        event_type: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Option<Value>> {
        if !topics::is_valid_token(agent_id) {
            return Err(Error::Validation(format!("invalid agent id '{}'", agent_id)));
        }
        let event = AgentEvent::new(event_type, data);
        match self
            .bus
            .request(&topics::events(agent_id), serde_json::to_value(&event)?, timeout)
            .await
        {
            Ok(reply) => Ok(Some(reply.payload)),
            Err(e) if e.is_timeout() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcell_bus::MemoryBus;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_routes_by_recipient() {
        let bus = MemoryBus::new();
        let mut events = bus.subscribe("agent.a1.events").await.unwrap();
        let mut broadcasts = bus.subscribe(topics::BROADCAST).await.unwrap();
        let messenger = Messenger::new(Arc::new(bus.clone()), "cli");

        messenger.send("a1", MessageKind::Text, json!("hi")).await.unwrap();
        let event = AgentEvent::parse(events.recv().await.unwrap().payload).unwrap();
        assert_eq!(event.event_type, "message");
        assert_eq!(event.data["to"], "a1");
        assert_eq!(event.data["from"], "cli");

        messenger.send("all", MessageKind::Command, json!("reload")).await.unwrap();
        let broadcast = BroadcastMessage::parse(broadcasts.recv().await.unwrap().payload).unwrap();
        assert_eq!(broadcast.message_type, "message");
        assert_eq!(broadcast.message["kind"], "command");
    }

    #[tokio::test]
    async fn test_rejects_dotted_agent_id() {
        let messenger = Messenger::new(Arc::new(MemoryBus::new()), "cli");
        assert!(messenger.event("a.b", "shutdown", Value::Null).await.is_err());
        assert!(messenger.status("a.*", Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test]
    async fn test_status_timeout_is_none() {
        let messenger = Messenger::new(Arc::new(MemoryBus::new()), "cli");
        assert!(messenger.status("a1", Duration::from_millis(20)).await.unwrap().is_none());
    }
}
