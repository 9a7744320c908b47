use chrono::Utc;
use meshcell_core::TopicPattern;
use std::path::PathBuf;

pub async fn run(config: Option<PathBuf>, pattern: &str) -> anyhow::Result<()> {
    TopicPattern::parse(pattern)?;
    let config = super::load_config(config)?;
    let bus = super::connect(&config).await?;
    let mut subscription = bus.subscribe(pattern).await?;
    eprintln!("Watching '{}' on {} (Ctrl-C to stop)", pattern, config.bus.url);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = subscription.recv() => match message {
                Some(message) => {
                    let reply = message
                        .reply_to
                        .as_deref()
                        .map(|r| format!(" (reply to {})", r))
                        .unwrap_or_default();
                    println!(
                        "{} {}{} {}",
                        Utc::now().format("%H:%M:%S%.3f"),
                        message.topic,
                        reply,
                        message.payload
                    );
                }
                None => anyhow::bail!("bus connection closed"),
            },
        }
    }
    Ok(())
}
