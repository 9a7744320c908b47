use meshcell_bus::{Bus, BusConnector};
use meshcell_core::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Keep a bus-facing service alive across connection loss.
///
/// `serve` runs once per connection and returns `Ok(())` only when cancelled.
/// Failures are logged and retried after `retry_delay`; the service runs
/// degraded in between instead of exiting.
pub async fn supervise<F, Fut>(
    name: &str,
    connector: &dyn BusConnector,
    retry_delay: Duration,
    cancel: CancellationToken,
    mut serve: F,
) where
    F: FnMut(Arc<dyn Bus>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            connected = connector.connect() => connected,
        };
        match connected {
            Ok(bus) => match serve(bus).await {
                Ok(()) => break,
                Err(e) => warn!(service = %name, error = %e, "Lost the bus, running degraded"),
            },
            Err(e) => error!(service = %name, error = %e, "Bus unreachable, running degraded"),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(retry_delay) => {}
        }
        info!(service = %name, "Reconnecting to bus");
    }
    info!(service = %name, "Stopped");
}
