//! Wire types shared by the hive coordinator and its worker agents.
//!
//! Everything here travels as JSON over HTTP:
//!
//! - **Agent → Coordinator**: registration, heartbeats (direct or relayed by a
//!   group leader), unregistration, leadership claims
//! - **Coordinator → Agent**: registration acknowledgement with tier and
//!   heartbeat interval, heartbeat acknowledgement
//! - **Clients → Coordinator**: routing hints, broadcast jobs, admin listings
//!
//! The coordinator treats service payloads it forwards as opaque bytes, so no
//! service-level request format lives in this crate.

mod coordinator;
mod error;
mod types;

pub use coordinator::{
    BatchHeartbeatRequest, BatchHeartbeatResponse, BatchHeartbeatResult, BatchOutcome,
    BroadcastRequest, BroadcastResponse, HeartbeatRequest, HeartbeatResponse, JobOutcome,
    LeadershipResponse, RegisterRequest, RegisterResponse, RelayedHeartbeat, ServiceHealthReport,
    ServiceSummary, UnregisterResponse, WorkerJobResult, WorkerSummary,
};
pub use error::{ErrorBody, ErrorCode};
pub use types::{
    DeclaredCapabilities, LoadMetrics, RouteHints, ServiceDeclaration, ServiceHealth, Tier,
    WorkerStatus,
};

/// Heartbeat group used when a worker does not name one.
pub const DEFAULT_HEARTBEAT_GROUP: &str = "default";

/// HTTP headers carrying routing hints on proxied requests.
pub mod headers {
    /// Model the selected worker should have loaded.
    pub const REQUIRED_MODEL: &str = "x-hive-model";

    /// Specialization to prefer over the requested service name.
    pub const SPECIALIZATION: &str = "x-hive-specialization";

    /// Worker that served a routed request (response header).
    pub const SERVED_BY: &str = "x-hive-worker";
}
