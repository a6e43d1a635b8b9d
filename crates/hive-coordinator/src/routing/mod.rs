//! Routing engine: selects workers for a service and fans out broadcast jobs.
//!
//! Only the in-memory view is consulted; the store is never read on the
//! routing path.

mod backend;
mod scoring;

pub use backend::{strip_hop_by_hop, ForwardRequest, ForwardResponse, HttpBackend, WorkerBackend};
pub use scoring::{score, tier_weight, ScoreBreakdown};

use futures::future::join_all;
use hive_proto::{BroadcastResponse, JobOutcome, RouteHints, Tier, WorkerJobResult};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RoutingConfig;
use crate::error::{CoordinatorError, Result};
use crate::registry::{WorkerRecord, WorkerRegistry};
use crate::sweeper::LivenessSweeper;

/// A chosen target.
#[derive(Debug, Clone)]
pub struct Selection {
    pub worker: WorkerRecord,
    pub score: ScoreBreakdown,
    /// Base URL requests for the service go to.
    pub base_url: String,
}

/// Capability-aware router.
pub struct RoutingEngine {
    sweeper: Arc<LivenessSweeper>,
    registry: Arc<WorkerRegistry>,
    backend: Arc<dyn WorkerBackend>,
    config: RoutingConfig,
    rng: Mutex<SmallRng>,
}

impl std::fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingEngine")
            .field("backend", &self.backend)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RoutingEngine {
    #[must_use]
    pub fn new(
        sweeper: Arc<LivenessSweeper>,
        backend: Arc<dyn WorkerBackend>,
        config: RoutingConfig,
    ) -> Self {
        Self {
            registry: sweeper.registry().clone(),
            sweeper,
            backend,
            config,
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    /// Replaces the jitter source, for reproducible selection.
    #[must_use]
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
            ..self
        }
    }

    fn jitter(&self) -> f64 {
        if self.config.jitter <= 0.0 {
            return 0.0;
        }
        self.rng.lock().gen_range(0.0..=self.config.jitter)
    }

    /// Picks the highest scoring live worker for `service`.
    pub async fn select_worker(&self, service: &str, hints: &RouteHints) -> Result<Selection> {
        let candidates = self.sweeper.live_candidates(service).await;
        if candidates.is_empty() {
            return Err(self.no_candidate(service).await);
        }

        let mut best: Option<(WorkerRecord, ScoreBreakdown)> = None;
        for worker in candidates {
            let mut breakdown = score(&worker, service, hints);
            breakdown.jitter = self.jitter();
            let better = best
                .as_ref()
                .map_or(true, |(_, current)| breakdown.total() > current.total());
            if better {
                best = Some((worker, breakdown));
            }
        }

        let (worker, score) = best.ok_or_else(|| CoordinatorError::Internal("empty candidate set".into()))?;
        debug!(service, worker_id = %worker.id, score = score.total(), "worker selected");
        let base_url = base_url(&worker, service);
        Ok(Selection {
            worker,
            score,
            base_url,
        })
    }

    /// Selects a worker and forwards `request` to it.
    pub async fn route(
        &self,
        service: &str,
        hints: &RouteHints,
        request: ForwardRequest,
    ) -> Result<(Selection, ForwardResponse)> {
        let selection = match self.select_worker(service, hints).await {
            Ok(selection) => selection,
            Err(e) => {
                metrics::counter!("hive_routes_total", "outcome" => "no_candidate").increment(1);
                return Err(e);
            }
        };

        match self
            .backend
            .forward(&selection.base_url, request, self.config.forward_timeout)
            .await
        {
            Ok(response) => {
                metrics::counter!("hive_routes_total", "outcome" => "forwarded").increment(1);
                Ok((selection, response))
            }
            Err(e) => {
                metrics::counter!("hive_routes_total", "outcome" => "error").increment(1);
                warn!(service, worker_id = %selection.worker.id, error = %e, "forwarding failed");
                Err(e)
            }
        }
    }

    /// Sends `payload` to every live worker offering `capability`, each with
    /// its own timeout. Failures are reported per worker.
    pub async fn broadcast(
        &self,
        capability: &str,
        payload: &serde_json::Value,
        max_tier: Option<Tier>,
    ) -> Result<BroadcastResponse> {
        let cutoff = max_tier.or(self.config.broadcast_max_tier);
        let targets: Vec<WorkerRecord> = self
            .broadcast_targets(capability)
            .await
            .into_iter()
            .filter(|w| cutoff.map_or(true, |tier| w.tier.rank() <= tier.rank()))
            .collect();

        if targets.is_empty() {
            return Err(self.no_candidate(capability).await);
        }

        let timeout = self.config.broadcast_timeout;
        let jobs = targets.iter().map(|worker| {
            let url = format!("{}{}", base_url(worker, capability), self.config.job_path);
            let backend = self.backend.clone();
            async move {
                let started = Instant::now();
                let outcome = tokio::time::timeout(timeout, backend.submit_job(&url, payload, timeout))
                    .await
                    .unwrap_or(Err(CoordinatorError::Timeout));
                let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                let (outcome, status_code, detail) = match outcome {
                    Ok(status) if (200..300).contains(&status) => {
                        (JobOutcome::Accepted, Some(status), None)
                    }
                    Ok(status) => (JobOutcome::Rejected, Some(status), None),
                    Err(e) => (JobOutcome::Error, None, Some(e.to_string())),
                };
                WorkerJobResult {
                    worker_id: worker.id.clone(),
                    outcome,
                    status_code,
                    detail,
                    elapsed_ms,
                }
            }
        });
        let per_worker_results = join_all(jobs).await;

        let successful = per_worker_results
            .iter()
            .filter(|r| r.outcome == JobOutcome::Accepted)
            .count();
        let failed = per_worker_results.len() - successful;

        metrics::counter!("hive_broadcasts_total").increment(1);
        info!(
            capability,
            broadcasted_to = per_worker_results.len(),
            successful,
            failed,
            "broadcast finished"
        );

        Ok(BroadcastResponse {
            capability: capability.to_owned(),
            broadcasted_to: per_worker_results.len(),
            successful,
            failed,
            per_worker_results,
        })
    }

    /// Live workers declaring `capability`, plus service-less workers whose
    /// tier role is `capability`. Sorted by id.
    async fn broadcast_targets(&self, capability: &str) -> Vec<WorkerRecord> {
        let mut targets: BTreeMap<String, WorkerRecord> = self
            .sweeper
            .live_candidates(capability)
            .await
            .into_iter()
            .map(|w| (w.id.clone(), w))
            .collect();

        for worker in self.sweeper.view_all().await {
            let by_role = worker.services.is_empty()
                && worker.status.is_routable()
                && worker.assigned_services.iter().any(|s| s == capability);
            if by_role {
                targets.entry(worker.id.clone()).or_insert(worker);
            }
        }

        targets.into_values().collect()
    }

    /// Builds the error for an unroutable service, listing services that do
    /// have a live worker.
    async fn no_candidate(&self, service: &str) -> CoordinatorError {
        let mut available_services = Vec::new();
        for name in self.registry.index().services() {
            if name != service && !self.sweeper.live_candidates(&name).await.is_empty() {
                available_services.push(name);
            }
        }
        debug!(service, ?available_services, "no candidate");
        CoordinatorError::NoCandidate {
            service: service.to_owned(),
            available_services,
        }
    }
}

/// The declared endpoint of `service` when it is an absolute URL, otherwise
/// the worker's address. No trailing slash.
#[must_use]
pub fn base_url(worker: &WorkerRecord, service: &str) -> String {
    let endpoint = worker
        .service(service)
        .and_then(|s| s.endpoint.as_deref())
        .filter(|e| e.starts_with("http://") || e.starts_with("https://"));
    let base = match endpoint {
        Some(endpoint) => endpoint.to_owned(),
        None if worker.address.contains("://") => worker.address.clone(),
        None => format!("http://{}", worker.address),
    };
    base.trim_end_matches('/').to_owned()
}
