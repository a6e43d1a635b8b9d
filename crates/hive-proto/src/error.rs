//! Error bodies returned by the coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed registration or heartbeat.
    InvalidPayload,
    /// Worker id not registered; the caller must re-register.
    UnknownWorker,
    /// No healthy worker provides the requested service.
    ServiceUnavailable,
    /// Batch heartbeat sent by a worker that does not hold the leader slot.
    NotLeader,
    /// The store's write budget is exhausted; retry with backoff.
    BudgetExceeded,
    /// The selected worker failed to answer.
    BadGateway,
    /// Operation timed out.
    Timeout,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidPayload => "invalid_payload",
            Self::UnknownWorker => "unknown_worker",
            Self::ServiceUnavailable => "service_unavailable",
            Self::NotLeader => "not_leader",
            Self::BudgetExceeded => "budget_exceeded",
            Self::BadGateway => "bad_gateway",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// JSON error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorCode,
    pub message: String,
    /// Services that do have healthy workers, on `service_unavailable`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_services: Option<Vec<String>>,
    /// What the caller should do next.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl ErrorBody {
    /// Creates an error body with a code and message.
    #[must_use]
    pub fn new(error: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
            available_services: None,
            action: None,
        }
    }

    /// Attaches the list of services that can still be routed to.
    #[must_use]
    pub fn with_available_services(mut self, services: Vec<String>) -> Self {
        self.available_services = Some(services);
        self
    }

    /// Attaches a follow-up action.
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_wire_name() {
        for code in [
            ErrorCode::InvalidPayload,
            ErrorCode::UnknownWorker,
            ErrorCode::ServiceUnavailable,
            ErrorCode::NotLeader,
            ErrorCode::BudgetExceeded,
            ErrorCode::BadGateway,
            ErrorCode::Timeout,
            ErrorCode::Internal,
        ] {
            let wire = serde_json::to_value(code).unwrap();
            assert_eq!(wire, serde_json::Value::String(code.to_string()));
        }
    }

    #[test]
    fn service_unavailable_body() {
        let body = ErrorBody::new(ErrorCode::ServiceUnavailable, "no worker for ocr")
            .with_available_services(vec!["rag".into()]);

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"], "service_unavailable");
        assert_eq!(json["available_services"][0], "rag");
        assert!(json.get("action").is_none());
    }
}
