//! Configuration types for the coordinator.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use hive_proto::Tier;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::{CoordinatorError, Result};

const ENV_PREFIX: &str = "HIVE_COORDINATOR_";

/// Largest accepted `routing.jitter`.
pub const MAX_JITTER: f64 = 5.0;

/// Coordinator configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// HTTP API configuration.
    pub api: ApiConfig,
    /// Backing store selection.
    pub store: StoreConfig,
    /// Write-budget and persistence policy.
    pub persistence: PersistenceConfig,
    /// Heartbeat and timeout configuration.
    pub liveness: LivenessConfig,
    /// Capability classifier configuration.
    pub classifier: ClassifierConfig,
    /// Routing and broadcast configuration.
    pub routing: RoutingConfig,
    /// Heartbeat leader election configuration.
    pub leader: LeaderConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl CoordinatorConfig {
    /// Load configuration from `coordinator.toml` and `HIVE_COORDINATOR_*`
    /// environment variables.
    pub fn load() -> Result<Self> {
        Self::extract(Figment::new().merge(Toml::file("coordinator.toml")))
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::extract(Figment::new().merge(Toml::file(path.as_ref())))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| CoordinatorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the liveness and budget logic cannot honour.
    pub fn validate(&self) -> Result<()> {
        let liveness = &self.liveness;
        if liveness.soft_timeout >= liveness.hard_timeout {
            return Err(CoordinatorError::Config(format!(
                "liveness.soft_timeout ({}s) must be shorter than liveness.hard_timeout ({}s)",
                liveness.soft_timeout.as_secs(),
                liveness.hard_timeout.as_secs()
            )));
        }
        if liveness.heartbeat_interval.is_zero() || liveness.sweep_interval.is_zero() {
            return Err(CoordinatorError::Config(
                "liveness intervals must be greater than zero".to_owned(),
            ));
        }

        let persistence = &self.persistence;
        if persistence.max_writes == 0 || persistence.window.is_zero() {
            return Err(CoordinatorError::Config(
                "persistence.max_writes and persistence.window must be greater than zero"
                    .to_owned(),
            ));
        }
        if persistence.high_priority_reserve > persistence.max_writes {
            return Err(CoordinatorError::Config(format!(
                "persistence.high_priority_reserve ({}) exceeds persistence.max_writes ({})",
                persistence.high_priority_reserve, persistence.max_writes
            )));
        }
        if persistence.flush_interval.is_zero() {
            return Err(CoordinatorError::Config(
                "persistence.flush_interval must be greater than zero".to_owned(),
            ));
        }

        let jitter = self.routing.jitter;
        if !jitter.is_finite() || !(0.0..=MAX_JITTER).contains(&jitter) {
            return Err(CoordinatorError::Config(format!(
                "routing.jitter ({jitter}) must be between 0 and {MAX_JITTER}"
            )));
        }
        if self.leader.claim_attempts == 0 {
            return Err(CoordinatorError::Config(
                "leader.claim_attempts must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

/// HTTP API configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8090),
        }
    }
}

/// Backing store selection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-process map; state is lost on restart.
    #[default]
    Memory,
    /// Valkey/Redis.
    Valkey(ValkeyConfig),
}

/// Valkey configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValkeyConfig {
    /// Connection URL.
    pub url: String,
    /// Key namespace, prepended as `{namespace}:`.
    pub namespace: Option<String>,
    /// Maximum pool connections.
    pub pool_size: usize,
}

impl Default for ValkeyConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_owned(),
            namespace: Some("hive".to_owned()),
            pool_size: 8,
        }
    }
}

/// Persistence and write-budget policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Minimum time between freshness-only persists of a worker record.
    #[serde(with = "serde_duration_secs")]
    pub persist_interval: Duration,
    /// Writes allowed per window.
    pub max_writes: u32,
    /// Length of the rolling budget window.
    #[serde(with = "serde_duration_secs")]
    pub window: Duration,
    /// Part of `max_writes` only high-priority writes may use.
    pub high_priority_reserve: u32,
    /// Maximum number of coalesced low-priority writes held in memory.
    pub max_pending: usize,
    /// How often queued low-priority writes are flushed.
    #[serde(with = "serde_duration_secs")]
    pub flush_interval: Duration,
    /// Per-operation store timeout in milliseconds.
    pub operation_timeout_ms: u64,
}

impl PersistenceConfig {
    /// Per-operation store timeout.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            persist_interval: Duration::from_secs(300),
            max_writes: 10_000,
            window: Duration::from_secs(24 * 60 * 60),
            high_priority_reserve: 2_000,
            max_pending: 4_096,
            flush_interval: Duration::from_secs(60),
            operation_timeout_ms: 2_000,
        }
    }
}

/// Heartbeat and timeout configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Heartbeat interval handed to workers at registration.
    #[serde(with = "serde_duration_secs")]
    pub heartbeat_interval: Duration,
    /// Silence after which a worker is reported offline.
    #[serde(with = "serde_duration_secs")]
    pub soft_timeout: Duration,
    /// Silence after which a worker is deleted.
    #[serde(with = "serde_duration_secs")]
    pub hard_timeout: Duration,
    /// Period of the scheduled sweep.
    #[serde(with = "serde_duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            soft_timeout: Duration::from_secs(90),
            hard_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Capability classifier configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Coordinator round-trip below which a worker counts as edge.
    pub edge_latency_threshold_ms: u32,
    /// Service names treated as storage/database services.
    pub storage_services: Vec<String>,
}

impl ClassifierConfig {
    /// Returns true if `service` is a storage or database service.
    #[must_use]
    pub fn is_storage_service(&self, service: &str) -> bool {
        self.storage_services
            .iter()
            .any(|s| s.eq_ignore_ascii_case(service))
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            edge_latency_threshold_ms: 50,
            storage_services: ["storage", "database", "postgres", "redis", "minio", "s3"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Routing and broadcast configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Upper bound of the uniform tie-breaking jitter added to scores, at
    /// most [`MAX_JITTER`].
    pub jitter: f64,
    /// Timeout for a routed request.
    #[serde(with = "serde_duration_secs")]
    pub forward_timeout: Duration,
    /// Per-worker timeout for broadcast jobs.
    #[serde(with = "serde_duration_secs")]
    pub broadcast_timeout: Duration,
    /// Default tier cut-off for broadcasts.
    pub broadcast_max_tier: Option<Tier>,
    /// Path broadcast jobs are posted to on each worker.
    pub job_path: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            jitter: 5.0,
            forward_timeout: Duration::from_secs(60),
            broadcast_timeout: Duration::from_secs(10),
            broadcast_max_tier: None,
            job_path: "/jobs".to_owned(),
        }
    }
}

/// Heartbeat leader election configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    /// Timeout for a single compare-and-swap attempt.
    pub claim_timeout_ms: u64,
    /// Attempts before giving up on a claim.
    pub claim_attempts: u32,
}

impl LeaderConfig {
    /// Timeout for a single compare-and-swap attempt.
    #[must_use]
    pub const fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            claim_timeout_ms: 500,
            claim_attempts: 3,
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install the Prometheus recorder.
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Serde helper for Duration as seconds.
mod serde_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
