use meshcell_bus::{hub, MemoryBus};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn run(config: Option<PathBuf>, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let config = super::load_config(config)?;
    let host = host.unwrap_or(config.hub.host);
    let port = port.unwrap_or(config.hub.port);

    let bind_addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    let bus = MemoryBus::new();
    let shutdown = CancellationToken::new();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    println!("meshcell hub on ws://{}/bus", bind_addr);
    hub::serve(listener, bus.clone(), shutdown).await?;
    bus.close();
    Ok(())
}
