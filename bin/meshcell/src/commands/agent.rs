use meshcell_agent::{AgentRuntime, ExitReason};
use meshcell_bus::RemoteConnector;
use meshcell_core::Config;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Command-line values that take precedence over the config file.
pub struct Overrides {
    pub id: Option<String>,
    pub name: Option<String>,
    pub capabilities: Vec<String>,
    pub task_types: Vec<String>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if self.id.is_some() {
            config.agent.id = self.id;
        }
        if self.name.is_some() {
            config.agent.display_name = self.name;
        }
        if !self.capabilities.is_empty() {
            config.agent.capabilities = self.capabilities;
        }
        if !self.task_types.is_empty() {
            config.agent.task_types = self.task_types;
        }
    }
}

pub async fn run(config: Option<PathBuf>, overrides: Overrides) -> anyhow::Result<()> {
    let mut config = super::load_config(config)?;
    overrides.apply(&mut config);
    // Pin the id so a restart comes back under the same identity.
    config.agent.id = Some(config.agent.resolve_id());
    config.validate()?;

    let connector = RemoteConnector::from_config(&config.bus);
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    loop {
        let runtime = AgentRuntime::from_config(&config);
        let agent_id = runtime.agent_id().to_string();
        info!(agent_id = %agent_id, bus = %config.bus.url, "Starting agent");

        match runtime.run(&connector, shutdown.cancelled()).await? {
            ExitReason::Restart if !shutdown.is_cancelled() => {
                info!(agent_id = %agent_id, "Restarting agent");
            }
            reason => {
                info!(agent_id = %agent_id, reason = %reason, "Agent exited");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_config_values() {
        let mut config = Config::default();
        config.agent.capabilities = vec!["search".to_string()];

        Overrides {
            id: Some("worker-1".to_string()),
            name: None,
            capabilities: Vec::new(),
            task_types: vec!["uppercase".to_string(), "delay".to_string()],
        }
        .apply(&mut config);

        assert_eq!(config.agent.id.as_deref(), Some("worker-1"));
        assert!(config.agent.display_name.is_none());
        assert_eq!(config.agent.capabilities, vec!["search".to_string()]);
        assert_eq!(config.agent.task_types, vec!["uppercase".to_string(), "delay".to_string()]);
    }
}
