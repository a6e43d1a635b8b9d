//! Error types for the coordinator.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hive_proto::{ErrorBody, ErrorCode};
use thiserror::Error;

use crate::store::StoreError;

/// Coordinator errors.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Malformed registration, heartbeat or request body.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Worker id is not registered.
    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    /// No live worker provides the requested service.
    #[error("no healthy worker for service: {service}")]
    NoCandidate {
        service: String,
        available_services: Vec<String>,
    },

    /// Batch heartbeat from a worker that does not hold the group's slot.
    #[error("worker {worker_id} is not heartbeat leader of group {group}")]
    NotLeader { worker_id: String, group: String },

    /// A high-priority write did not fit in the store's write budget.
    #[error("write budget exceeded")]
    BudgetExceeded,

    /// Backing store failure.
    #[error("store error: {0}")]
    Store(StoreError),

    /// Forwarding to a worker failed.
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BudgetExceeded => Self::BudgetExceeded,
            StoreError::Timeout => Self::Timeout,
            other => Self::Store(other),
        }
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialisation(err.to_string())
    }
}

impl From<JsonRejection> for CoordinatorError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidPayload(rejection.body_text())
    }
}

impl CoordinatorError {
    /// Wire error code for this error.
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidPayload(_) => ErrorCode::InvalidPayload,
            Self::UnknownWorker(_) => ErrorCode::UnknownWorker,
            Self::NoCandidate { .. } => ErrorCode::ServiceUnavailable,
            Self::NotLeader { .. } => ErrorCode::NotLeader,
            Self::BudgetExceeded => ErrorCode::BudgetExceeded,
            Self::Dispatch(_) => ErrorCode::BadGateway,
            Self::Timeout => ErrorCode::Timeout,
            Self::Store(_) | Self::Config(_) | Self::Serialisation(_) | Self::Internal(_) => {
                ErrorCode::Internal
            }
        }
    }

    /// HTTP status for this error.
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::UnknownWorker(_) => StatusCode::NOT_FOUND,
            Self::NotLeader { .. } => StatusCode::CONFLICT,
            Self::NoCandidate { .. } | Self::BudgetExceeded => StatusCode::SERVICE_UNAVAILABLE,
            Self::Dispatch(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Store(_) | Self::Config(_) | Self::Serialisation(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        // Sanitise error messages for external responses
        let body = match self {
            Self::InvalidPayload(reason) => ErrorBody::new(code, reason),
            Self::UnknownWorker(id) => ErrorBody::new(code, format!("unknown worker: {id}"))
                .with_action("register again before sending heartbeats"),
            Self::NoCandidate {
                service,
                available_services,
            } => ErrorBody::new(code, format!("no healthy worker provides '{service}'"))
                .with_available_services(available_services)
                .with_action("retry later or use one of the available services"),
            Self::NotLeader { group, .. } => ErrorBody::new(
                code,
                format!("sender does not hold the heartbeat leader slot for group '{group}'"),
            )
            .with_action("send heartbeats directly to the coordinator"),
            Self::BudgetExceeded => ErrorBody::new(code, "store write budget exhausted")
                .with_action("retry with backoff"),
            Self::Dispatch(_) => ErrorBody::new(code, "selected worker did not respond"),
            Self::Timeout => ErrorBody::new(code, "request timed out"),

            // Hide internal details
            Self::Store(_) | Self::Config(_) | Self::Serialisation(_) | Self::Internal(_) => {
                ErrorBody::new(code, "internal server error")
            }
        };

        (status, Json(body)).into_response()
    }
}

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_codes() {
        assert_eq!(
            CoordinatorError::UnknownWorker("w-1".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            CoordinatorError::NotLeader {
                worker_id: "w-1".into(),
                group: "default".into()
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            CoordinatorError::Timeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn store_errors_map_to_coordinator_errors() {
        assert!(matches!(
            CoordinatorError::from(StoreError::BudgetExceeded),
            CoordinatorError::BudgetExceeded
        ));
        assert!(matches!(
            CoordinatorError::from(StoreError::Timeout),
            CoordinatorError::Timeout
        ));
        assert!(matches!(
            CoordinatorError::from(StoreError::Backend("boom".into())),
            CoordinatorError::Store(_)
        ));
    }

    #[test]
    fn internal_errors_are_sanitised() {
        let err = CoordinatorError::Store(StoreError::Connection("redis://secret@host".into()));
        assert_eq!(err.error_code(), ErrorCode::Internal);
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
