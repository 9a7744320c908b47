use meshcell_client::CapabilityClient;
use meshcell_core::CapabilityStatus;
use std::path::PathBuf;
use std::time::Duration;

pub async fn run(config: Option<PathBuf>, name: &str, params: &str, timeout_ms: u64) -> anyhow::Result<()> {
    let params = super::parse_value(params);
    let config = super::load_config(config)?;
    let bus = super::connect(&config).await?;
    let client = CapabilityClient::new(bus, "cli");

    let response = client
        .request(name, params, Duration::from_millis(timeout_ms))
        .await?;
    super::print_json(&response)?;

    match response.status {
        CapabilityStatus::Ok => Ok(()),
        status => anyhow::bail!(
            "capability '{}' {}: {}",
            name,
            status,
            response.error.as_deref().unwrap_or("no responder")
        ),
    }
}
