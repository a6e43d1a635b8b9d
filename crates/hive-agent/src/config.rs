//! Configuration for the worker agent.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use hive_proto::{DeclaredCapabilities, ServiceDeclaration};
use serde::Deserialize;

use crate::error::{AgentError, AgentResult};

const ENV_PREFIX: &str = "HIVE_AGENT_";

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    /// Coordinator connection.
    #[serde(default)]
    pub coordinator: CoordinatorClientConfig,

    /// This worker's identity and address.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Capabilities to declare. Unset CPU and memory figures are detected.
    #[serde(default)]
    pub capabilities: DeclaredCapabilities,

    /// Services hosted on this machine.
    #[serde(default)]
    pub services: Vec<LocalService>,

    /// Local health probing.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Heartbeat relay.
    #[serde(default)]
    pub relay: RelayConfig,
}

impl AgentConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `agent.toml` in the current directory (if present)
    /// 3. Environment variables with `HIVE_AGENT_` prefix
    pub fn load() -> AgentResult<Self> {
        Self::extract(Figment::new().merge(Toml::file("agent.toml")))
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> AgentResult<Self> {
        Self::extract(Figment::new().merge(Toml::file(path.as_ref())))
    }

    fn extract(figment: Figment) -> AgentResult<Self> {
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| AgentError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the agent cannot register with.
    pub fn validate(&self) -> AgentResult<()> {
        if self.worker.address.trim().is_empty() {
            return Err(AgentError::Config(
                "worker.address must be set to a routable endpoint".to_owned(),
            ));
        }
        if self.coordinator.url.trim().is_empty() {
            return Err(AgentError::Config("coordinator.url must be set".to_owned()));
        }
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(AgentError::Config("service names must not be empty".to_owned()));
            }
        }
        if self.relay.flush_interval_secs == 0 {
            return Err(AgentError::Config(
                "relay.flush_interval_secs must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Coordinator client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorClientConfig {
    /// Base URL of the coordinator API.
    #[serde(default = "default_coordinator_url")]
    pub url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_coordinator_url() -> String {
    "http://127.0.0.1:8090".to_owned()
}

const fn default_timeout_secs() -> u64 {
    10
}

impl Default for CoordinatorClientConfig {
    fn default() -> Self {
        Self {
            url: default_coordinator_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Worker identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Address the coordinator routes to, e.g. a tunnel URL.
    #[serde(default)]
    pub address: String,

    /// File holding the UUID the worker id is derived from.
    #[serde(default = "default_identity_path")]
    pub identity_path: PathBuf,

    /// Heartbeat group for relay leadership.
    #[serde(default)]
    pub heartbeat_group: Option<String>,
}

fn default_identity_path() -> PathBuf {
    PathBuf::from("/var/lib/hive/identity")
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            identity_path: default_identity_path(),
            heartbeat_group: None,
        }
    }
}

/// A service running on this machine.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalService {
    /// Service name as routed by the coordinator.
    pub name: String,

    /// Base URL the service listens on locally, probed for health.
    pub endpoint: String,

    /// Endpoint to advertise instead of `endpoint`, if the local URL is not
    /// reachable from the coordinator.
    #[serde(default)]
    pub public_endpoint: Option<String>,

    /// Model served.
    #[serde(default)]
    pub model: Option<String>,

    /// Domain specialization.
    #[serde(default)]
    pub specialization: Option<String>,

    /// Health path below `endpoint`.
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

fn default_health_path() -> String {
    "/health".to_owned()
}

impl LocalService {
    /// Declaration sent at registration.
    #[must_use]
    pub fn declaration(&self) -> ServiceDeclaration {
        let mut declaration = ServiceDeclaration::new(&self.name);
        if let Some(endpoint) = &self.public_endpoint {
            declaration = declaration.with_endpoint(endpoint);
        }
        if let Some(model) = &self.model {
            declaration = declaration.with_model(model);
        }
        if let Some(specialization) = &self.specialization {
            declaration = declaration.with_specialization(specialization);
        }
        declaration
    }

    /// URL probed for health.
    #[must_use]
    pub fn health_url(&self) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.health_path.trim_start_matches('/')
        )
    }
}

/// Health probe configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Timeout for one health probe in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

const fn default_probe_timeout_ms() -> u64 {
    2_000
}

impl ProbeConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// Heartbeat relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Claim the group's leader slot and relay peer heartbeats when elected.
    #[serde(default)]
    pub enabled: bool,

    /// Address the relay endpoint listens on.
    #[serde(default = "default_relay_listen")]
    pub listen_addr: SocketAddr,

    /// How often relayed heartbeats are flushed to the coordinator.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Relay of the group leader. Heartbeats go there first and fall back to
    /// the coordinator.
    #[serde(default)]
    pub peer_url: Option<String>,
}

fn default_relay_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8091)
}

const fn default_flush_interval_secs() -> u64 {
    10
}

impl RelayConfig {
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_relay_listen(),
            flush_interval_secs: default_flush_interval_secs(),
            peer_url: None,
        }
    }
}
