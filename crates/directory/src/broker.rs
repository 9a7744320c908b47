use meshcell_bus::{Bus, BusMessage};
use meshcell_core::{topics, CapabilityRequest, CapabilityResponse, Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::RegistryHandle;

/// Routes `capability.request` to whichever agent answers `capability.dispatch`
/// first. No reply within the timeout is an `unavailable` response, not an error.
///
/// Advertised capabilities are descriptive: the registry, when attached, is only
/// consulted to log that nobody claims the capability.
#[derive(Clone)]
pub struct CapabilityBroker {
    registry: Option<RegistryHandle>,
    default_timeout: Duration,
}

impl CapabilityBroker {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            registry: None,
            default_timeout,
        }
    }

    pub fn with_registry(mut self, registry: RegistryHandle) -> Self {
        self.registry = Some(registry);
        self
    }

    pub async fn serve(&self, bus: Arc<dyn Bus>, cancel: CancellationToken) -> Result<()> {
        let mut requests = bus.subscribe(topics::CAPABILITY_REQUEST).await?;
        info!(default_timeout_ms = self.default_timeout.as_millis() as u64, "Capability broker serving");

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                message = requests.recv() => message,
            };
            let Some(message) = message else {
                return Err(Error::Closed("capability.request subscription closed".to_string()));
            };
            let Some(request) = self.parse_request(&message) else {
                continue;
            };
            let broker = self.clone();
            let bus = bus.clone();
            tokio::spawn(async move {
                let response = broker.dispatch(bus.as_ref(), &request).await;
                match serde_json::to_value(&response) {
                    Ok(payload) => {
                        if let Err(e) = bus.reply(&message, payload).await {
                            warn!(request_id = %request.request_id, error = %e, "Failed to answer capability request");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode capability response"),
                }
            });
        }
    }

    fn parse_request(&self, message: &BusMessage) -> Option<CapabilityRequest> {
        if message.reply_to.is_none() {
            warn!("Capability request without a reply channel, dropping");
            return None;
        }
        match CapabilityRequest::parse(message.payload.clone()) {
            Ok(mut request) => {
                if request.timeout_ms == 0 {
                    request.timeout_ms = self.default_timeout.as_millis() as u64;
                }
                Some(request)
            }
            Err(e) => {
                warn!(error = %e, "Dropping invalid capability request");
                None
            }
        }
    }

    /// Republish to agents and wait for the first answer.
    pub async fn dispatch(&self, bus: &dyn Bus, request: &CapabilityRequest) -> CapabilityResponse {
        if let Some(registry) = &self.registry {
            if let Ok(0) = registry.online_with_capability(&request.capability).await {
                info!(
                    capability = %request.capability,
                    "No online agent advertises this capability, dispatching anyway"
                );
            }
        }

        let payload = match serde_json::to_value(request) {
            Ok(payload) => payload,
            Err(e) => return CapabilityResponse::error(request, "broker", &e.to_string()),
        };
        let timeout = Duration::from_millis(request.timeout_ms);
        debug!(request_id = %request.request_id, capability = %request.capability, "Dispatching capability request");

        match bus.request(topics::CAPABILITY_DISPATCH, payload, timeout).await {
            Ok(reply) => match reply.decode::<CapabilityResponse>() {
                Ok(response) if response.request_id == request.request_id => response,
                Ok(response) => {
                    warn!(
                        expected = %request.request_id,
                        got = %response.request_id,
                        "Capability reply for another request"
                    );
                    CapabilityResponse::error(request, "broker", "mismatched capability reply")
                }
                Err(e) => CapabilityResponse::error(request, "broker", &e.to_string()),
            },
            Err(e) if e.is_timeout() => {
                info!(
                    capability = %request.capability,
                    timeout_ms = request.timeout_ms,
                    "Capability unavailable"
                );
                CapabilityResponse::unavailable(request)
            }
            Err(e) => {
                warn!(capability = %request.capability, error = %e, "Capability dispatch failed");
                CapabilityResponse {
                    error: Some(e.to_string()),
                    ..CapabilityResponse::unavailable(request)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcell_bus::MemoryBus;
    use meshcell_core::CapabilityStatus;
    use serde_json::json;
    use std::time::Instant;

    #[tokio::test]
    async fn test_unavailable_after_timeout() {
        let bus = MemoryBus::new();
        let broker = CapabilityBroker::new(Duration::from_secs(5));
        let request = CapabilityRequest::new("nonexistent", json!({}), "test", 60);
        let started = Instant::now();
        let response = broker.dispatch(&bus, &request).await;
        assert_eq!(response.status, CapabilityStatus::Unavailable);
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_first_responder_wins() {
        let bus = MemoryBus::new();
        let mut dispatch = bus.subscribe(topics::CAPABILITY_DISPATCH).await.unwrap();
        let responder = bus.clone();
        tokio::spawn(async move {
            while let Some(msg) = dispatch.recv().await {
                let request = CapabilityRequest::parse(msg.payload.clone()).unwrap();
                let response = CapabilityResponse::ok(&request, "a1", json!("done"));
                responder
                    .reply(&msg, serde_json::to_value(&response).unwrap())
                    .await
                    .unwrap();
            }
        });

        let broker = CapabilityBroker::new(Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let serving = {
            let broker = broker.clone();
            let bus: Arc<dyn Bus> = Arc::new(bus.clone());
            let cancel = cancel.clone();
            tokio::spawn(async move { broker.serve(bus, cancel).await })
        };
        while bus.subscriber_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // timeoutMs omitted: the broker's default applies.
        let reply = bus
            .request(
                topics::CAPABILITY_REQUEST,
                json!({"requestId": "r1", "capability": "summarize", "parameters": {}}),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        let response: CapabilityResponse = reply.decode().unwrap();
        assert_eq!(response.request_id, "r1");
        assert_eq!(response.status, CapabilityStatus::Ok);
        assert_eq!(response.responder_id.as_deref(), Some("a1"));

        cancel.cancel();
        assert!(serving.await.unwrap().is_ok());
    }
}
