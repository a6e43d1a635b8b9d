//! Coordinator protocol messages.
//!
//! - **Agent → Coordinator**: registration, heartbeats, unregistration
//! - **Leader → Coordinator**: batched heartbeats for a heartbeat group
//! - **Coordinator → Clients**: worker and service listings, broadcast results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{
    DeclaredCapabilities, LoadMetrics, ServiceDeclaration, ServiceHealth, Tier, WorkerStatus,
};

/// Worker registration request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Stable worker identifier. The coordinator generates one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Routable endpoint for the worker, e.g. a tunnel URL.
    pub address: String,
    /// Declared host capabilities.
    #[serde(default, alias = "declared_capabilities")]
    pub capabilities: DeclaredCapabilities,
    /// Services the worker hosts. May be empty for pure compute nodes.
    #[serde(default)]
    pub services: Vec<ServiceDeclaration>,
    /// Heartbeat group for leader election.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_group: Option<String>,
    /// Metadata for version tracking.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl RegisterRequest {
    /// Creates a registration request with only an address.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            worker_id: None,
            address: address.into(),
            capabilities: DeclaredCapabilities::default(),
            services: Vec::new(),
            heartbeat_group: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Sets the worker id.
    #[must_use]
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Sets the declared capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: DeclaredCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Adds a hosted service.
    #[must_use]
    pub fn with_service(mut self, service: ServiceDeclaration) -> Self {
        self.services.push(service);
        self
    }

    /// Sets the heartbeat group.
    #[must_use]
    pub fn with_heartbeat_group(mut self, group: impl Into<String>) -> Self {
        self.heartbeat_group = Some(group.into());
        self
    }
}

/// Registration response from the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Identifier the worker must use from now on.
    pub worker_id: String,
    /// Tier the worker was classified into.
    pub tier: Tier,
    /// Services (or tier role) the worker is assigned.
    pub assigned_services: Vec<String>,
    /// Heartbeat interval the worker should use (seconds).
    pub heartbeat_interval_secs: u64,
}

/// Health of one service as reported in a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealthReport {
    /// Service name.
    pub name: String,
    /// Probed health.
    pub health: ServiceHealth,
}

/// Worker heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Self-reported status.
    #[serde(default)]
    pub status: WorkerStatus,
    /// Current load.
    #[serde(default)]
    pub load: LoadMetrics,
    /// Per-service health.
    #[serde(default)]
    pub service_health: Vec<ServiceHealthReport>,
    /// When the agent produced this heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl HeartbeatRequest {
    /// Creates a heartbeat with the given load.
    #[must_use]
    pub fn new(load: LoadMetrics) -> Self {
        Self {
            status: WorkerStatus::Healthy,
            load,
            service_health: Vec::new(),
            sent_at: Some(Utc::now()),
        }
    }

    /// Adds a per-service health report.
    #[must_use]
    pub fn with_service_health(mut self, name: impl Into<String>, health: ServiceHealth) -> Self {
        self.service_health.push(ServiceHealthReport {
            name: name.into(),
            health,
        });
        self
    }
}

/// Heartbeat acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// False when the heartbeat was older than the recorded one and dropped.
    pub accepted: bool,
    /// Seconds until the next heartbeat is expected.
    pub next_heartbeat_secs: u64,
}

/// Heartbeat forwarded by a group leader on behalf of a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayedHeartbeat {
    /// Worker the heartbeat belongs to.
    pub worker_id: String,
    /// The heartbeat itself.
    #[serde(flatten)]
    pub heartbeat: HeartbeatRequest,
}

/// Batch of heartbeats sent by a heartbeat group leader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchHeartbeatRequest {
    /// Worker currently holding the group's leader slot.
    pub leader_id: String,
    /// Heartbeat group.
    pub group: String,
    /// Latest heartbeat per peer.
    pub heartbeats: Vec<RelayedHeartbeat>,
}

/// Outcome of a single heartbeat inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    /// Applied.
    Accepted,
    /// Older than the recorded heartbeat.
    Discarded,
    /// Worker must re-register.
    UnknownWorker,
    /// Payload failed validation.
    Invalid,
}

/// Per-worker result of a batch heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHeartbeatResult {
    /// Worker the heartbeat belonged to.
    pub worker_id: String,
    /// What happened to it.
    pub outcome: BatchOutcome,
}

/// Response to a batch heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHeartbeatResponse {
    /// One entry per relayed heartbeat, in request order.
    pub results: Vec<BatchHeartbeatResult>,
    /// Seconds until the next heartbeat is expected.
    pub next_heartbeat_secs: u64,
}

/// Unregistration acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterResponse {
    /// Always true on success.
    pub ack: bool,
}

/// Result of a leadership claim or release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipResponse {
    /// Heartbeat group the slot belongs to.
    pub group: String,
    /// Whether the caller holds the slot after the operation.
    pub leader: bool,
    /// Current holder, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
}

/// Summary of a worker for admin listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub id: String,
    pub tier: Tier,
    pub status: WorkerStatus,
    pub address: String,
    pub capabilities: DeclaredCapabilities,
    pub services: Vec<ServiceDeclaration>,
    pub assigned_services: Vec<String>,
    pub load: LoadMetrics,
    pub heartbeat_group: String,
    pub is_heartbeat_leader: bool,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_persisted_at: Option<DateTime<Utc>>,
    pub last_heartbeat_secs_ago: u64,
}

/// Summary of a service for admin listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub service_name: String,
    pub worker_count: usize,
    pub workers: Vec<String>,
}

/// Broadcast job request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastRequest {
    /// Job payload, forwarded to every target unchanged.
    pub payload: serde_json::Value,
    /// Only target workers at this tier or better (e.g. `cpu` = GPU + CPU).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tier: Option<Tier>,
}

/// How a single worker handled a broadcast job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// Worker answered with a success status.
    Accepted,
    /// Worker answered with a non-success status.
    Rejected,
    /// Worker could not be reached in time.
    Error,
}

/// Per-worker broadcast result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerJobResult {
    pub worker_id: String,
    pub outcome: JobOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub elapsed_ms: u64,
}

/// Broadcast job response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResponse {
    pub capability: String,
    pub broadcasted_to: usize,
    pub successful: usize,
    pub failed: usize,
    pub per_worker_results: Vec<WorkerJobResult>,
}
