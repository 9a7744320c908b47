use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Agent identity. Generated at startup when absent.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Descriptive capability names advertised in the announce.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Built-in task handlers to enable.
    #[serde(default = "default_task_types")]
    pub task_types: Vec<String>,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_task_types() -> Vec<String> {
    vec!["echo".to_string()]
}

fn default_max_concurrent_tasks() -> usize {
    1
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: None,
            display_name: None,
            capabilities: Vec::new(),
            task_types: default_task_types(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl AgentConfig {
    /// The configured id, or a fresh `agent-<8 hex>` one.
    pub fn resolve_id(&self) -> String {
        match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let raw = uuid::Uuid::new_v4().simple().to_string();
                format!("agent-{}", &raw[..8])
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    #[serde(default = "default_bus_url")]
    pub url: String,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_bus_url() -> String {
    "ws://127.0.0.1:18800/bus".to_string()
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_base_delay_ms() -> u64 {
    500
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: default_bus_url(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl BusConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    #[serde(default = "default_hub_host")]
    pub host: String,
    #[serde(default = "default_hub_port")]
    pub port: u16,
}

fn default_hub_host() -> String {
    "127.0.0.1".to_string()
}

fn default_hub_port() -> u16 {
    18800
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: default_hub_host(),
            port: default_hub_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinationConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Staleness threshold as a multiple of the heartbeat interval.
    #[serde(default = "default_staleness_multiplier")]
    pub staleness_multiplier: u32,
    /// Explicit threshold; overrides the multiplier when set.
    #[serde(default)]
    pub staleness_threshold_ms: Option<u64>,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_capability_timeout_ms")]
    pub capability_timeout_ms: u64,
    /// Remove agents offline for longer than this. Absent means never.
    #[serde(default)]
    pub evict_after_ms: Option<u64>,
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_staleness_multiplier() -> u32 {
    3
}

fn default_sweep_interval_ms() -> u64 {
    10_000
}

fn default_capability_timeout_ms() -> u64 {
    5_000
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            staleness_multiplier: default_staleness_multiplier(),
            staleness_threshold_ms: None,
            sweep_interval_ms: default_sweep_interval_ms(),
            capability_timeout_ms: default_capability_timeout_ms(),
            evict_after_ms: None,
        }
    }
}

impl CoordinationConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn staleness_threshold(&self) -> Duration {
        match self.staleness_threshold_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.heartbeat_interval() * self.staleness_multiplier.max(1),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn capability_timeout(&self) -> Duration {
        Duration::from_millis(self.capability_timeout_ms)
    }

    pub fn evict_after(&self) -> Option<Duration> {
        self.evict_after_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.coordination.heartbeat_interval_ms == 0 {
            return Err(Error::Config("coordination.heartbeatIntervalMs must be > 0".to_string()));
        }
        if self.coordination.sweep_interval_ms == 0 {
            return Err(Error::Config("coordination.sweepIntervalMs must be > 0".to_string()));
        }
        if self.bus.reconnect_base_delay_ms > self.bus.reconnect_max_delay_ms {
            return Err(Error::Config(
                "bus.reconnectBaseDelayMs must not exceed bus.reconnectMaxDelayMs".to_string(),
            ));
        }
        if let Some(id) = self.agent.id.as_deref() {
            if !id.is_empty() && !crate::topics::is_valid_token(id) {
                return Err(Error::Config(format!(
                    "agent.id '{}' must be a single topic token (no '.', '*', '>' or whitespace)",
                    id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.coordination.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(cfg.coordination.staleness_threshold(), Duration::from_secs(90));
        assert_eq!(cfg.bus.max_reconnect_attempts, 10);
        assert_eq!(cfg.agent.task_types, vec!["echo".to_string()]);
        assert!(cfg.coordination.evict_after().is_none());
    }

    #[test]
    fn test_explicit_staleness_overrides_multiplier() {
        let raw = r#"{ "coordination": { "heartbeatIntervalMs": 100, "stalenessThresholdMs": 250 } }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.coordination.staleness_threshold(), Duration::from_millis(250));
    }

    #[test]
    fn test_validate_rejects_dotted_agent_id() {
        let raw = r#"{ "agent": { "id": "agent.one" } }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_resolve_id() {
        let mut agent = AgentConfig::default();
        let generated = agent.resolve_id();
        assert!(generated.starts_with("agent-"));
        assert_eq!(generated.len(), "agent-".len() + 8);
        agent.id = Some("worker-7".to_string());
        assert_eq!(agent.resolve_id(), "worker-7");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().join("meshcell"));
        let mut cfg = Config::default();
        cfg.agent.id = Some("agent-a".to_string());
        cfg.hub.port = 19000;
        cfg.save(&paths.config_file()).unwrap();

        let loaded = Config::load_or_default(&paths).unwrap();
        assert_eq!(loaded.agent.id.as_deref(), Some("agent-a"));
        assert_eq!(loaded.hub.port, 19000);
    }
}
