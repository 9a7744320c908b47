use meshcell_bus::{Bus, BusMessage, Subscription};
use meshcell_core::{
    topics, Announce, BroadcastMessage, DirectoryFilter, Error, Heartbeat, Result,
};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::RegistryHandle;

/// Bus surface of the registry: consumes announce and heartbeat traffic and
/// answers `directory.list` / `directory.get`.
#[derive(Clone)]
pub struct DirectoryService {
    registry: RegistryHandle,
}

impl DirectoryService {
    pub fn new(registry: RegistryHandle) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Serve one bus connection. Returns `Ok(())` when cancelled and an error
    /// when the bus closes underneath.
    pub async fn serve(&self, bus: Arc<dyn Bus>, cancel: CancellationToken) -> Result<()> {
        let mut announces = bus.subscribe(topics::ANNOUNCE).await?;
        let mut statuses = bus.subscribe(topics::STATUS_PATTERN).await?;
        let mut lists = bus.subscribe(topics::DIRECTORY_LIST).await?;
        let mut gets = bus.subscribe(topics::DIRECTORY_GET).await?;

        // The roster is not persisted: ask running agents to introduce themselves.
        let rollcall = BroadcastMessage::new("announce", Value::Null);
        bus.publish(topics::BROADCAST, serde_json::to_value(&rollcall)?).await?;
        info!("Directory serving");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                message = announces.recv() => self.on_announce(next(message, &announces)?),
                message = statuses.recv() => self.on_heartbeat(next(message, &statuses)?),
                message = lists.recv() => self.on_list(bus.as_ref(), next(message, &lists)?).await,
                message = gets.recv() => self.on_get(bus.as_ref(), next(message, &gets)?).await,
            }
        }
    }

    fn on_announce(&self, message: BusMessage) {
        let announce: Announce = match message.decode() {
            Ok(announce) => announce,
            Err(e) => {
                warn!(error = %e, "Dropping invalid announce");
                return;
            }
        };
        if !topics::is_valid_token(&announce.id) {
            warn!(agent_id = %announce.id, "Dropping announce with an invalid agent id");
            return;
        }
        if let Err(e) = self.registry.announce(announce) {
            warn!(error = %e, "Registry unavailable");
        }
    }

    fn on_heartbeat(&self, message: BusMessage) {
        let heartbeat: Heartbeat = match message.decode() {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                warn!(error = %e, "Dropping invalid heartbeat");
                return;
            }
        };
        if topics::agent_id_from_status(&message.topic) != Some(heartbeat.agent_id.as_str()) {
            warn!(
                topic = %message.topic,
                agent_id = %heartbeat.agent_id,
                "Heartbeat agent id does not match its topic, dropping"
            );
            return;
        }
        if let Err(e) = self.registry.heartbeat(heartbeat) {
            warn!(error = %e, "Registry unavailable");
        }
    }

    async fn on_list(&self, bus: &dyn Bus, message: BusMessage) {
        let filter = match parse_filter(&message.payload) {
            Ok(filter) => filter,
            Err(e) => {
                warn!(error = %e, "Dropping invalid directory.list request");
                return;
            }
        };
        let agents = match self.registry.list(filter).await {
            Ok(agents) => agents,
            Err(e) => {
                warn!(error = %e, "Registry unavailable");
                return;
            }
        };
        debug!(filter = ?filter, count = agents.len(), "directory.list");
        match serde_json::to_value(&agents) {
            Ok(payload) => {
                if let Err(e) = bus.reply(&message, payload).await {
                    warn!(error = %e, "Failed to answer directory.list");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode agent list"),
        }
    }

    async fn on_get(&self, bus: &dyn Bus, message: BusMessage) {
        let id = match parse_id(&message.payload) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Dropping invalid directory.get request");
                return;
            }
        };
        let agent = match self.registry.get(&id).await {
            Ok(agent) => agent,
            Err(e) => {
                warn!(error = %e, "Registry unavailable");
                return;
            }
        };
        debug!(agent_id = %id, found = agent.is_some(), "directory.get");
        match serde_json::to_value(&agent) {
            Ok(payload) => {
                if let Err(e) = bus.reply(&message, payload).await {
                    warn!(error = %e, "Failed to answer directory.get");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode agent"),
        }
    }
}

fn next(message: Option<BusMessage>, subscription: &Subscription) -> Result<BusMessage> {
    message.ok_or_else(|| Error::Closed(format!("subscription '{}' closed", subscription.pattern())))
}

/// Accepts `null`, `"online"`, or `{"filter": "online"}`.
fn parse_filter(payload: &Value) -> Result<DirectoryFilter> {
    match payload {
        Value::Null => Ok(DirectoryFilter::All),
        Value::String(s) => s.parse(),
        Value::Object(map) => match map.get("filter") {
            None | Some(Value::Null) => Ok(DirectoryFilter::All),
            Some(Value::String(s)) => s.parse(),
            Some(other) => Err(Error::Validation(format!("filter must be a string, got {}", other))),
        },
        other => Err(Error::Validation(format!("unexpected list payload {}", other))),
    }
}

/// Accepts `"a1"` or `{"id": "a1"}`.
fn parse_id(payload: &Value) -> Result<String> {
    let id = match payload {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map.get("id").and_then(|v| v.as_str()).unwrap_or_default(),
        _ => "",
    };
    if id.trim().is_empty() {
        return Err(Error::Validation("directory.get needs an agent id".to_string()));
    }
    Ok(id.to_string())
}
