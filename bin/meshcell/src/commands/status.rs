use std::path::PathBuf;

pub async fn run(config: Option<PathBuf>) -> anyhow::Result<()> {
    let path = super::config_path(config.clone());

    println!("meshcell status");
    println!("===============");
    println!();

    let exists = path.exists();
    println!(
        "Config:      {} {}",
        path.display(),
        if exists { "✓" } else { "✗ (not found, using defaults)" }
    );

    let config = super::load_config(config)?;
    let coordination = &config.coordination;

    println!("Bus:         {}", config.bus.url);
    println!("Hub:         {}:{}", config.hub.host, config.hub.port);
    println!();
    println!("Agent:");
    println!(
        "  id:        {}",
        config.agent.id.as_deref().unwrap_or("(generated at start)")
    );
    println!("  taskTypes: {}", config.agent.task_types.join(", "));
    if !config.agent.capabilities.is_empty() {
        println!("  capabilities: {}", config.agent.capabilities.join(", "));
    }
    println!("  maxConcurrentTasks: {}", config.agent.max_concurrent_tasks);
    println!();
    println!("Coordination:");
    println!("  heartbeat: {} ms", coordination.heartbeat_interval_ms);
    println!(
        "  staleness: {} ms",
        coordination.staleness_threshold().as_millis()
    );
    println!("  sweep:     {} ms", coordination.sweep_interval_ms);
    println!("  capability timeout: {} ms", coordination.capability_timeout_ms);
    match coordination.evict_after_ms {
        Some(ms) => println!("  evict offline agents after: {} ms", ms),
        None => println!("  evict offline agents: never"),
    }

    if !exists {
        println!();
        println!("Run `meshcell onboard` to write a config file.");
    }

    Ok(())
}
