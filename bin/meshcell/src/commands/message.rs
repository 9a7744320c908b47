use meshcell_client::Messenger;
use meshcell_core::MessageKind;
use std::path::PathBuf;

const SENDER: &str = "cli";

pub async fn send(config: Option<PathBuf>, to: &str, content: &str, kind: MessageKind) -> anyhow::Result<()> {
    let config = super::load_config(config)?;
    let bus = super::connect(&config).await?;
    let messenger = Messenger::new(bus.clone(), SENDER);

    let envelope = messenger.send(to, kind, super::parse_value(content)).await?;
    bus.flush().await?;
    println!("Sent {:?} message to {}", envelope.kind, envelope.to);
    Ok(())
}

pub async fn event(
    config: Option<PathBuf>,
    agent_id: &str,
    event_type: &str,
    data: &str,
    wait: bool,
) -> anyhow::Result<()> {
    let config = super::load_config(config)?;
    let bus = super::connect(&config).await?;
    let messenger = Messenger::new(bus.clone(), SENDER);
    let data = super::parse_value(data);

    if !wait {
        messenger.event(agent_id, event_type, data).await?;
        bus.flush().await?;
        println!("Sent '{}' event to {}", event_type, agent_id);
        return Ok(());
    }

    match messenger
        .ask(agent_id, event_type, data, config.bus.request_timeout())
        .await?
    {
        Some(reply) => super::print_json(&reply),
        None => anyhow::bail!("{} did not answer '{}'", agent_id, event_type),
    }
}

pub async fn broadcast(config: Option<PathBuf>, message_type: &str, message: &str) -> anyhow::Result<()> {
    let config = super::load_config(config)?;
    let bus = super::connect(&config).await?;
    let messenger = Messenger::new(bus.clone(), SENDER);

    messenger
        .broadcast(message_type, super::parse_value(message))
        .await?;
    bus.flush().await?;
    println!("Broadcast '{}'", message_type);
    Ok(())
}
