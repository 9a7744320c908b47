pub mod agent;
pub mod agents;
pub mod capability;
pub mod directory;
pub mod hub;
pub mod message;
pub mod onboard;
pub mod status;
pub mod task;
pub mod watch;

use meshcell_bus::{Bus, BusConnector, RemoteConnector};
use meshcell_core::{Config, Paths};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

pub fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| Paths::new().config_file())
}

/// Load the config at `explicit` (or the default location), falling back to
/// defaults when no file exists.
pub fn load_config(explicit: Option<PathBuf>) -> anyhow::Result<Config> {
    let path = config_path(explicit);
    if path.exists() {
        Ok(Config::load(&path)?)
    } else {
        Ok(Config::default())
    }
}

pub async fn connect(config: &Config) -> anyhow::Result<Arc<dyn Bus>> {
    Ok(RemoteConnector::from_config(&config.bus).connect().await?)
}

/// JSON when it parses, otherwise the raw text as a string.
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_value_falls_back_to_text() {
        assert_eq!(parse_value(r#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value("hello there"), json!("hello there"));
    }
}
