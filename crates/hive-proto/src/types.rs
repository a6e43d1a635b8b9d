//! Common types used across the protocol.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Coarse capability class of a worker.
///
/// The numeric rank orders tiers from most to least capable and is what
/// broadcast tier cut-offs compare against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Worker with a usable GPU.
    Gpu = 1,
    /// General compute worker.
    Cpu = 2,
    /// Worker that only hosts storage or database services.
    Storage = 3,
    /// Publicly reachable or low-latency worker used for edge routing.
    Edge = 4,
}

impl Tier {
    /// Returns the numeric rank (GPU=1 .. Edge=4).
    #[must_use]
    #[allow(clippy::as_conversions)]
    pub const fn rank(self) -> u8 {
        self as u8
    }

    /// Returns the lowercase name used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gpu => "gpu",
            Self::Cpu => "cpu",
            Self::Storage => "storage",
            Self::Edge => "edge",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gpu" | "1" => Ok(Self::Gpu),
            "cpu" | "2" => Ok(Self::Cpu),
            "storage" | "3" => Ok(Self::Storage),
            "edge" | "4" => Ok(Self::Edge),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// Worker status as seen by routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// All declared services are healthy.
    #[default]
    Healthy,
    /// At least one declared service reported a problem.
    Degraded,
    /// Heartbeats stopped arriving.
    Offline,
}

impl WorkerStatus {
    /// Returns true if the worker may be selected for requests.
    #[must_use]
    pub const fn is_routable(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Degraded => f.write_str("degraded"),
            Self::Offline => f.write_str("offline"),
        }
    }
}

/// Health of a single locally hosted service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    /// Service answered its health probe.
    #[default]
    Healthy,
    /// Service answered, but not successfully.
    Degraded,
    /// Service did not answer.
    Unhealthy,
}

/// Load reported with every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadMetrics {
    /// CPU load normalised to [0, 1].
    #[serde(default)]
    pub cpu_load: f64,
    /// GPU utilisation in [0, 1], if the worker has a GPU.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_utilization: Option<f64>,
    /// Requests currently in flight on the worker.
    #[serde(default)]
    pub active_requests: u32,
}

impl LoadMetrics {
    /// Creates load metrics with the given CPU load.
    #[must_use]
    pub fn with_cpu_load(cpu_load: f64) -> Self {
        Self {
            cpu_load,
            ..Self::default()
        }
    }

    /// Checks that fractional fields are finite and inside [0, 1].
    pub fn validate(&self) -> Result<(), String> {
        check_fraction("cpu_load", self.cpu_load)?;
        if let Some(gpu) = self.gpu_utilization {
            check_fraction("gpu_utilization", gpu)?;
        }
        Ok(())
    }
}

fn check_fraction(field: &str, value: f64) -> Result<(), String> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("{field} must be within [0, 1], got {value}"))
    }
}

/// Host capabilities declared at registration.
///
/// Known fields are typed; anything else the agent reports is kept in
/// `extra` so newer agents can talk to older coordinators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeclaredCapabilities {
    /// Logical CPU cores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u32>,
    /// System memory in MB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_mb: Option<u64>,
    /// GPU model name, e.g. "RTX 4090".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_model: Option<String>,
    /// GPU memory in MB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_mb: Option<u64>,
    /// Storage offered to the fleet in GB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_gb: Option<u64>,
    /// Round-trip latency to the coordinator measured by the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator_rtt_ms: Option<u32>,
    /// Free-form capabilities not modelled above.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl DeclaredCapabilities {
    /// Returns true if the worker declares GPU capability.
    #[must_use]
    pub fn has_gpu(&self) -> bool {
        self.gpu_memory_mb.is_some_and(|mb| mb > 0)
            || self
                .gpu_model
                .as_deref()
                .is_some_and(|model| !model.trim().is_empty())
    }

    /// Rejects values that are present but meaningless.
    pub fn validate(&self) -> Result<(), String> {
        if self.cpu_cores == Some(0) {
            return Err("cpu_cores must be greater than zero".to_owned());
        }
        if self.ram_mb == Some(0) {
            return Err("ram_mb must be greater than zero".to_owned());
        }
        if let Some(model) = &self.gpu_model {
            if model.trim().is_empty() {
                return Err("gpu_model must not be blank".to_owned());
            }
        }
        Ok(())
    }
}

/// A service hosted by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDeclaration {
    /// Service name, e.g. "inference" or "rag".
    pub name: String,
    /// Port or absolute URL the service is reachable at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Model the service has loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// What the service is specialised for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialization: Option<String>,
    /// Health from the agent's last probe.
    #[serde(default)]
    pub health: ServiceHealth,
}

impl ServiceDeclaration {
    /// Creates a healthy service declaration with only a name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: None,
            model: None,
            specialization: None,
            health: ServiceHealth::Healthy,
        }
    }

    /// Sets the endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the loaded model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the specialization.
    #[must_use]
    pub fn with_specialization(mut self, specialization: impl Into<String>) -> Self {
        self.specialization = Some(specialization.into());
        self
    }

    /// Sets the health.
    #[must_use]
    pub const fn with_health(mut self, health: ServiceHealth) -> Self {
        self.health = health;
        self
    }
}

/// Optional hints attached to a routing request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHints {
    /// Model the request needs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_model: Option<String>,
    /// Specialization to match instead of the service name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialization: Option<String>,
}

impl RouteHints {
    /// Hints requiring a specific model.
    #[must_use]
    pub fn model(model: impl Into<String>) -> Self {
        Self {
            required_model: Some(model.into()),
            specialization: None,
        }
    }
}
