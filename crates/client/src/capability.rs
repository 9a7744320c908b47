use meshcell_bus::Bus;
use meshcell_core::{topics, CapabilityRequest, CapabilityResponse, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Extra wait on top of the request timeout, so the broker's own
/// `unavailable` answer arrives before the caller gives up.
const BROKER_GRACE: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct CapabilityClient {
    bus: Arc<dyn Bus>,
    requester_id: String,
}

impl CapabilityClient {
    pub fn new(bus: Arc<dyn Bus>, requester_id: &str) -> Self {
        Self {
            bus,
            requester_id: requester_id.to_string(),
        }
    }

    /// Ask for a capability. Resolves within about `timeout`; absence is an
    /// `unavailable` response.
    pub async fn request(
        &self,
        capability: &str,
        parameters: serde_json::Value,
        timeout: Duration,
    ) -> Result<CapabilityResponse> {
        let timeout = timeout.max(Duration::from_millis(1));
        let request = CapabilityRequest::new(
            capability,
            parameters,
            &self.requester_id,
            timeout.as_millis() as u64,
        );
        debug!(request_id = %request.request_id, capability = %capability, "Capability request");
        match self
            .bus
            .request(
                topics::CAPABILITY_REQUEST,
                serde_json::to_value(&request)?,
                timeout + BROKER_GRACE,
            )
            .await
        {
            Ok(reply) => reply.decode(),
            // No broker either.
            Err(e) if e.is_timeout() => Ok(CapabilityResponse::unavailable(&request)),
            Err(e) => Err(e),
        }
    }
}
