use chrono::Utc;
use meshcell_client::DirectoryClient;
use meshcell_core::{Agent, DirectoryFilter};
use std::path::PathBuf;

pub async fn list(config: Option<PathBuf>, filter: &str) -> anyhow::Result<()> {
    let filter: DirectoryFilter = filter.parse()?;
    let config = super::load_config(config)?;
    let bus = super::connect(&config).await?;
    let client = DirectoryClient::new(bus, config.bus.request_timeout());

    let agents = client.list(filter).await?;
    if agents.is_empty() {
        println!("No agents.");
        return Ok(());
    }

    println!(
        "{:<20} {:<8} {:<10} {:<24} {}",
        "ID", "STATUS", "LAST SEEN", "TASK TYPES", "CAPABILITIES"
    );
    for agent in &agents {
        print_row(agent);
    }
    println!();
    let online = agents
        .iter()
        .filter(|a| a.status == meshcell_core::AgentStatus::Online)
        .count();
    println!("{} agents, {} online", agents.len(), online);
    Ok(())
}

pub async fn get(config: Option<PathBuf>, id: &str) -> anyhow::Result<()> {
    let config = super::load_config(config)?;
    let bus = super::connect(&config).await?;
    let client = DirectoryClient::new(bus, config.bus.request_timeout());

    match client.get(id).await? {
        Some(agent) => super::print_json(&agent),
        None => anyhow::bail!("agent '{}' not found", id),
    }
}

fn print_row(agent: &Agent) {
    let age = (Utc::now() - agent.last_seen_at).num_seconds().max(0);
    println!(
        "{:<20} {:<8} {:<10} {:<24} {}",
        agent.id,
        agent.status.to_string(),
        format!("{}s ago", age),
        join(&agent.task_types),
        join(&agent.capabilities),
    );
}

fn join<'a>(items: impl IntoIterator<Item = &'a String>) -> String {
    let joined: Vec<&str> = items.into_iter().map(String::as_str).collect();
    if joined.is_empty() {
        "-".to_string()
    } else {
        joined.join(",")
    }
}
