use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An ad-hoc capability request. `request_id` is unique per call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityRequest {
    pub request_id: String,
    pub capability: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub requester_id: String,
    /// Zero means "use the broker's default".
    #[serde(default)]
    pub timeout_ms: u64,
}

impl CapabilityRequest {
    pub fn new(
        capability: &str,
        parameters: serde_json::Value,
        requester_id: &str,
        timeout_ms: u64,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            capability: capability.to_string(),
            parameters,
            requester_id: requester_id.to_string(),
            timeout_ms,
        }
    }

    pub fn parse(value: serde_json::Value) -> Result<Self> {
        let req: CapabilityRequest = serde_json::from_value(value)
            .map_err(|e| Error::Validation(format!("malformed capability request: {}", e)))?;
        if req.request_id.is_empty() || req.capability.is_empty() {
            return Err(Error::Validation(
                "capability request needs a requestId and a capability".to_string(),
            ));
        }
        Ok(req)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStatus {
    Ok,
    Error,
    /// Nobody answered within the timeout. Expected, not exceptional.
    Unavailable,
}

impl std::fmt::Display for CapabilityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityStatus::Ok => write!(f, "ok"),
            CapabilityStatus::Error => write!(f, "error"),
            CapabilityStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityResponse {
    pub request_id: String,
    pub capability: String,
    pub status: CapabilityStatus,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder_id: Option<String>,
}

impl CapabilityResponse {
    pub fn ok(request: &CapabilityRequest, responder_id: &str, result: serde_json::Value) -> Self {
        Self {
            request_id: request.request_id.clone(),
            capability: request.capability.clone(),
            status: CapabilityStatus::Ok,
            result,
            error: None,
            responder_id: Some(responder_id.to_string()),
        }
    }

    pub fn error(request: &CapabilityRequest, responder_id: &str, error: &str) -> Self {
        Self {
            request_id: request.request_id.clone(),
            capability: request.capability.clone(),
            status: CapabilityStatus::Error,
            result: serde_json::Value::Null,
            error: Some(error.to_string()),
            responder_id: Some(responder_id.to_string()),
        }
    }

    pub fn unavailable(request: &CapabilityRequest) -> Self {
        Self {
            request_id: request.request_id.clone(),
            capability: request.capability.clone(),
            status: CapabilityStatus::Unavailable,
            result: serde_json::Value::Null,
            error: Some(format!(
                "capability '{}' unavailable (no reply within {}ms)",
                request.capability, request.timeout_ms
            )),
            responder_id: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status != CapabilityStatus::Unavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_ids_are_unique() {
        let a = CapabilityRequest::new("echo", json!({}), "cli", 1000);
        let b = CapabilityRequest::new("echo", json!({}), "cli", 1000);
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn test_unavailable_response_correlates() {
        let req = CapabilityRequest::new("nonexistent", json!(null), "cli", 1000);
        let resp = CapabilityResponse::unavailable(&req);
        assert_eq!(resp.request_id, req.request_id);
        assert_eq!(resp.status, CapabilityStatus::Unavailable);
        assert!(!resp.is_available());
        assert!(resp.responder_id.is_none());
    }

    #[test]
    fn test_parse_rejects_empty_capability() {
        let value = json!({"requestId": "r1", "capability": "", "requesterId": "x", "timeoutMs": 10});
        assert!(CapabilityRequest::parse(value).is_err());
        let value = json!({"requestId": "r1", "capability": "echo", "requesterId": "x", "timeoutMs": 10});
        assert_eq!(CapabilityRequest::parse(value).unwrap().capability, "echo");
    }
}
