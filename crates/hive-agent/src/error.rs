//! Error types for the worker agent.

use hive_proto::{ErrorBody, ErrorCode};

/// Result type alias using [`AgentError`].
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that can occur in the worker agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The identity file could not be read or written.
    #[error("identity error: {0}")]
    Identity(String),

    /// The coordinator no longer knows this worker; it must register again.
    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    /// The relay or coordinator refused a batch because the sender is not
    /// the group's heartbeat leader.
    #[error("not heartbeat leader of group {0}")]
    NotLeader(String),

    /// The coordinator answered with an error body.
    #[error("coordinator error ({status}): {message}")]
    Coordinator {
        /// HTTP status code.
        status: u16,
        /// Wire error code, when the body carried one.
        code: Option<ErrorCode>,
        /// Human-readable message.
        message: String,
    },

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Create an identity error.
    #[must_use]
    pub fn identity(msg: impl Into<String>) -> Self {
        Self::Identity(msg.into())
    }

    /// Maps an error body returned by the coordinator or a relay.
    #[must_use]
    pub fn from_body(status: u16, body: ErrorBody, subject: &str) -> Self {
        match body.error {
            ErrorCode::UnknownWorker => Self::UnknownWorker(subject.to_owned()),
            ErrorCode::NotLeader => Self::NotLeader(subject.to_owned()),
            code => Self::Coordinator {
                status,
                code: Some(code),
                message: body.message,
            },
        }
    }

    /// Returns true if the worker has to register again.
    #[must_use]
    pub const fn is_unknown_worker(&self) -> bool {
        matches!(self, Self::UnknownWorker(_))
    }
}
