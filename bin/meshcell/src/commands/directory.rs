use meshcell_bus::RemoteConnector;
use meshcell_directory::{spawn_registry, supervise, CapabilityBroker, DirectoryService, RegistrySettings};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn run(config: Option<PathBuf>, with_broker: bool) -> anyhow::Result<()> {
    let config = super::load_config(config)?;
    let settings = RegistrySettings::from_config(&config.coordination);
    info!(
        staleness_ms = settings.staleness_threshold.as_millis() as u64,
        sweep_ms = settings.sweep_interval.as_millis() as u64,
        broker = with_broker,
        "Starting directory"
    );

    let (registry, actor) = spawn_registry(settings);
    let service = DirectoryService::new(registry.clone());
    let broker = with_broker.then(|| {
        CapabilityBroker::new(config.coordination.capability_timeout()).with_registry(registry.clone())
    });
    drop(registry);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                cancel.cancel();
            }
        });
    }

    let connector = RemoteConnector::from_config(&config.bus);
    let retry_delay = Duration::from_millis(config.bus.reconnect_max_delay_ms);

    // The roster lives outside the loop, so it survives every reconnect.
    supervise("directory", &connector, retry_delay, cancel.clone(), |bus| {
        let service = service.clone();
        let broker = broker.clone();
        let cancel = cancel.clone();
        async move {
            match broker {
                Some(broker) => tokio::select! {
                    outcome = service.serve(bus.clone(), cancel.clone()) => outcome,
                    outcome = broker.serve(bus, cancel) => outcome,
                },
                None => service.serve(bus, cancel).await,
            }
        }
    })
    .await;

    drop(service);
    drop(broker);
    actor.await?;
    Ok(())
}
