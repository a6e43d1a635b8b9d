//! Host and local service probing.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use hive_proto::{
    DeclaredCapabilities, HeartbeatRequest, LoadMetrics, ServiceHealth, WorkerStatus,
};
use reqwest::Client;
use tracing::debug;

use crate::config::LocalService;

/// Produces the heartbeat sent on every tick.
#[async_trait]
pub trait HeartbeatSource: Send + Sync {
    async fn sample(&self) -> HeartbeatRequest;
}

/// Probes the configured local services over HTTP.
#[derive(Debug, Clone)]
pub struct ServiceProber {
    client: Client,
    services: Vec<LocalService>,
}

impl ServiceProber {
    /// Creates a prober with a per-probe `timeout`.
    pub fn new(services: Vec<LocalService>, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, services })
    }

    /// 2xx is healthy, any other status degraded, no answer unhealthy.
    pub async fn probe(&self, service: &LocalService) -> ServiceHealth {
        match self.client.get(service.health_url()).send().await {
            Ok(response) if response.status().is_success() => ServiceHealth::Healthy,
            Ok(response) => {
                debug!(service = %service.name, status = %response.status(), "service probe returned error status");
                ServiceHealth::Degraded
            }
            Err(e) => {
                debug!(service = %service.name, error = %e, "service probe failed");
                ServiceHealth::Unhealthy
            }
        }
    }

    /// Probes every service concurrently. Results keep configuration order.
    pub async fn probe_all(&self) -> Vec<(String, ServiceHealth)> {
        let probes = self.services.iter().map(|service| async move {
            (service.name.clone(), self.probe(service).await)
        });
        join_all(probes).await
    }
}

#[async_trait]
impl HeartbeatSource for ServiceProber {
    async fn sample(&self) -> HeartbeatRequest {
        let health = self.probe_all().await;
        let status = worker_status(health.iter().map(|(_, h)| *h));

        let mut heartbeat = HeartbeatRequest::new(LoadMetrics::with_cpu_load(cpu_load()));
        heartbeat.status = status;
        for (name, health) in health {
            heartbeat = heartbeat.with_service_health(name, health);
        }
        heartbeat
    }
}

/// Degraded as soon as one service is not healthy.
pub fn worker_status(health: impl IntoIterator<Item = ServiceHealth>) -> WorkerStatus {
    if health.into_iter().all(|h| h == ServiceHealth::Healthy) {
        WorkerStatus::Healthy
    } else {
        WorkerStatus::Degraded
    }
}

/// One-minute load average divided by available parallelism, clamped to
/// [0, 1]. Zero where `/proc/loadavg` does not exist.
#[must_use]
pub fn cpu_load() -> f64 {
    let Ok(contents) = std::fs::read_to_string("/proc/loadavg") else {
        return 0.0;
    };
    let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    parse_loadavg(&contents).map_or(0.0, |load| normalise_load(load, cores))
}

/// First field of `/proc/loadavg`.
#[must_use]
pub fn parse_loadavg(contents: &str) -> Option<f64> {
    contents.split_whitespace().next()?.parse().ok()
}

#[allow(clippy::cast_precision_loss)]
fn normalise_load(load: f64, cores: usize) -> f64 {
    (load / cores.max(1) as f64).clamp(0.0, 1.0)
}

/// `MemTotal` of `/proc/meminfo` in MB.
#[must_use]
pub fn parse_meminfo(contents: &str) -> Option<u64> {
    let line = contents.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

/// Fills CPU core and memory figures the configuration leaves unset.
#[must_use]
pub fn detect_capabilities(mut declared: DeclaredCapabilities) -> DeclaredCapabilities {
    if declared.cpu_cores.is_none() {
        declared.cpu_cores = std::thread::available_parallelism()
            .ok()
            .and_then(|n| u32::try_from(n.get()).ok());
    }
    if declared.ram_mb.is_none() {
        declared.ram_mb = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|contents| parse_meminfo(&contents));
    }
    declared
}
