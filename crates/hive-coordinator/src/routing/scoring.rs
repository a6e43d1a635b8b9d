//! Candidate scoring.

use hive_proto::{RouteHints, ServiceHealth, Tier};
use serde::Serialize;

use crate::registry::WorkerRecord;

const MODEL_MATCH: f64 = 100.0;
const SPECIALIZATION_MATCH: f64 = 50.0;
const HEALTHY_SERVICE: f64 = 10.0;
const CPU_LOAD_PENALTY: f64 = 30.0;
const REQUEST_PENALTY: f64 = 5.0;
const GPU_UTILIZATION_PENALTY: f64 = 20.0;

/// Base weight per tier.
#[must_use]
pub const fn tier_weight(tier: Tier) -> f64 {
    match tier {
        Tier::Gpu => 30.0,
        Tier::Cpu => 20.0,
        Tier::Storage => 10.0,
        Tier::Edge => 0.0,
    }
}

/// Per-term score of one candidate. Penalties are stored as negative values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub model_match: f64,
    pub specialization_match: f64,
    pub tier_weight: f64,
    pub service_health: f64,
    pub cpu_penalty: f64,
    pub request_penalty: f64,
    pub gpu_penalty: f64,
    pub jitter: f64,
}

impl ScoreBreakdown {
    #[must_use]
    pub fn total(&self) -> f64 {
        self.model_match
            + self.specialization_match
            + self.tier_weight
            + self.service_health
            + self.cpu_penalty
            + self.request_penalty
            + self.gpu_penalty
            + self.jitter
    }
}

/// Scores `record` as a target for `service`, without jitter.
///
/// The specialization term compares the service's declared specialization
/// with `hints.specialization`, or with the service name when no hint is
/// given.
#[must_use]
pub fn score(record: &WorkerRecord, service: &str, hints: &RouteHints) -> ScoreBreakdown {
    let declaration = record.service(service);
    let mut breakdown = ScoreBreakdown {
        tier_weight: tier_weight(record.tier),
        ..ScoreBreakdown::default()
    };

    if let (Some(wanted), Some(model)) = (
        hints.required_model.as_deref(),
        declaration.and_then(|d| d.model.as_deref()),
    ) {
        if wanted == model {
            breakdown.model_match = MODEL_MATCH;
        }
    }

    let wanted_specialization = hints.specialization.as_deref().unwrap_or(service);
    if declaration.and_then(|d| d.specialization.as_deref()) == Some(wanted_specialization) {
        breakdown.specialization_match = SPECIALIZATION_MATCH;
    }

    if declaration.is_some_and(|d| d.health == ServiceHealth::Healthy) {
        breakdown.service_health = HEALTHY_SERVICE;
    }

    let load = &record.load;
    breakdown.cpu_penalty = -CPU_LOAD_PENALTY * load.cpu_load.clamp(0.0, 1.0);
    breakdown.request_penalty = -REQUEST_PENALTY * f64::from(load.active_requests);
    if record.tier == Tier::Gpu {
        breakdown.gpu_penalty =
            -GPU_UTILIZATION_PENALTY * load.gpu_utilization.unwrap_or(0.0).clamp(0.0, 1.0);
    }

    breakdown
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hive_proto::{
        DeclaredCapabilities, LoadMetrics, ServiceDeclaration, WorkerStatus,
    };
    use rstest::rstest;

    fn record(tier: Tier, service: ServiceDeclaration, load: LoadMetrics) -> WorkerRecord {
        let json = serde_json::json!({
            "id": "w-test",
            "tier": tier,
            "address": "http://10.0.0.1:8000",
            "capabilities": DeclaredCapabilities::default(),
            "services": [service],
            "assigned_services": [],
            "status": WorkerStatus::Healthy,
            "load": load,
            "heartbeat_group": "default",
            "is_heartbeat_leader": false,
            "registered_at": Utc::now(),
            "last_heartbeat_at": Utc::now(),
            "last_persisted_at": null,
        });
        serde_json::from_value(json).unwrap()
    }

    fn rag(specialization: &str) -> ServiceDeclaration {
        ServiceDeclaration::new("rag").with_specialization(specialization)
    }

    #[test]
    fn specialization_dominates_small_load_difference() {
        let a = record(Tier::Cpu, rag("rag"), LoadMetrics::with_cpu_load(0.2));
        let b = record(Tier::Cpu, rag("other"), LoadMetrics::with_cpu_load(0.1));

        let a = score(&a, "rag", &RouteHints::default()).total();
        let b = score(&b, "rag", &RouteHints::default()).total();

        assert!((a - 74.0).abs() < 1e-9);
        assert!((b - 27.0).abs() < 1e-9);
    }

    #[test]
    fn model_hint_matches_declared_model() {
        let service = ServiceDeclaration::new("inference").with_model("llama-3-8b");
        let worker = record(Tier::Cpu, service, LoadMetrics::default());

        let hit = score(&worker, "inference", &RouteHints::model("llama-3-8b"));
        let miss = score(&worker, "inference", &RouteHints::model("mistral-7b"));

        assert!((hit.model_match - 100.0).abs() < f64::EPSILON);
        assert!(miss.model_match.abs() < f64::EPSILON);
    }

    #[test]
    fn specialization_hint_overrides_service_name() {
        let worker = record(Tier::Cpu, rag("legal"), LoadMetrics::default());
        let hints = RouteHints {
            specialization: Some("legal".into()),
            ..RouteHints::default()
        };

        assert!((score(&worker, "rag", &hints).specialization_match - 50.0).abs() < f64::EPSILON);
        assert!(score(&worker, "rag", &RouteHints::default())
            .specialization_match
            .abs()
            < f64::EPSILON);
    }

    #[rstest]
    #[case(Tier::Gpu, 30.0)]
    #[case(Tier::Cpu, 20.0)]
    #[case(Tier::Storage, 10.0)]
    #[case(Tier::Edge, 0.0)]
    fn tier_weights(#[case] tier: Tier, #[case] expected: f64) {
        let worker = record(tier, ServiceDeclaration::new("rag"), LoadMetrics::default());
        assert!((score(&worker, "rag", &RouteHints::default()).tier_weight - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn gpu_penalty_only_on_gpu_tier() {
        let load = LoadMetrics {
            gpu_utilization: Some(0.5),
            ..LoadMetrics::default()
        };
        let gpu = record(Tier::Gpu, ServiceDeclaration::new("inference"), load.clone());
        let cpu = record(Tier::Cpu, ServiceDeclaration::new("inference"), load);

        assert!((score(&gpu, "inference", &RouteHints::default()).gpu_penalty + 10.0).abs() < 1e-9);
        assert!(score(&cpu, "inference", &RouteHints::default()).gpu_penalty.abs() < f64::EPSILON);
    }

    #[test]
    fn unhealthy_service_loses_health_bonus() {
        let service = ServiceDeclaration::new("rag").with_health(ServiceHealth::Degraded);
        let worker = record(Tier::Cpu, service, LoadMetrics::default());
        assert!(score(&worker, "rag", &RouteHints::default()).service_health.abs() < f64::EPSILON);
    }

    #[rstest]
    #[case(0.0, 0.1)]
    #[case(0.3, 0.7)]
    #[case(0.9, 1.0)]
    fn score_is_monotonic_in_cpu_load(#[case] low: f64, #[case] high: f64) {
        let idle = record(Tier::Cpu, rag("rag"), LoadMetrics::with_cpu_load(low));
        let busy = record(Tier::Cpu, rag("rag"), LoadMetrics::with_cpu_load(high));

        let idle = score(&idle, "rag", &RouteHints::default()).total();
        let busy = score(&busy, "rag", &RouteHints::default()).total();
        assert!(busy < idle);
    }

    #[test]
    fn active_requests_penalised() {
        let load = LoadMetrics {
            active_requests: 3,
            ..LoadMetrics::default()
        };
        let worker = record(Tier::Cpu, ServiceDeclaration::new("rag"), load);
        assert!((score(&worker, "rag", &RouteHints::default()).request_penalty + 15.0).abs() < 1e-9);
    }
}
