//! Agent against a live coordinator over HTTP.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{serve, LiveCoordinator};
use hive_agent::{
    relay, AgentError, CoordinatorApi, CoordinatorClient, HeartbeatRelay, HeartbeatSource,
    HeartbeatTask, PeerRelay,
};
use hive_coordinator::CoordinatorConfig;
use hive_proto::{
    DeclaredCapabilities, HeartbeatRequest, LoadMetrics, RegisterRequest, RelayedHeartbeat,
    ServiceDeclaration, Tier,
};
use tokio_util::sync::CancellationToken;

fn gpu_worker(id: &str) -> RegisterRequest {
    RegisterRequest::new(format!("http://{id}.internal:8000"))
        .with_worker_id(id)
        .with_capabilities(DeclaredCapabilities {
            gpu_model: Some("RTX 4090".into()),
            ..DeclaredCapabilities::default()
        })
        .with_service(ServiceDeclaration::new("rag"))
}

fn cpu_worker(id: &str) -> RegisterRequest {
    RegisterRequest::new(format!("http://{id}.internal:8000"))
        .with_worker_id(id)
        .with_service(ServiceDeclaration::new("ocr"))
}

#[tokio::test]
async fn client_lifecycle_round_trip() {
    let coordinator = LiveCoordinator::start().await;
    let client = CoordinatorClient::with_url(&coordinator.url).unwrap();

    let registered = client.register(&gpu_worker("w-gpu")).await.unwrap();
    assert_eq!(registered.worker_id, "w-gpu");
    assert_eq!(registered.tier, Tier::Gpu);
    assert_eq!(registered.assigned_services, vec!["rag".to_owned()]);
    assert_eq!(registered.heartbeat_interval_secs, 30);

    let ack = client
        .heartbeat("w-gpu", &HeartbeatRequest::new(LoadMetrics::with_cpu_load(0.4)))
        .await
        .unwrap();
    assert!(ack.accepted);
    let record = coordinator.state.registry.get("w-gpu").unwrap();
    assert!((record.load.cpu_load - 0.4).abs() < f64::EPSILON);

    client.unregister("w-gpu").await.unwrap();
    assert!(coordinator.state.registry.get("w-gpu").is_none());

    let err = client
        .heartbeat("w-gpu", &HeartbeatRequest::new(LoadMetrics::default()))
        .await
        .unwrap_err();
    assert!(err.is_unknown_worker());
    assert!(client.unregister("w-gpu").await.unwrap_err().is_unknown_worker());
}

#[tokio::test]
async fn invalid_registration_surfaces_error_code() {
    let coordinator = LiveCoordinator::start().await;
    let client = CoordinatorClient::with_url(&coordinator.url).unwrap();

    let err = client
        .register(&RegisterRequest::new("").with_worker_id("w-bad"))
        .await
        .unwrap_err();
    match err {
        AgentError::Coordinator { status, code, .. } => {
            assert_eq!(status, 400);
            assert_eq!(code, Some(hive_proto::ErrorCode::InvalidPayload));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn leadership_claim_and_release() {
    let coordinator = LiveCoordinator::start().await;
    let client = CoordinatorClient::with_url(&coordinator.url).unwrap();
    client.register(&cpu_worker("w-a")).await.unwrap();
    client.register(&cpu_worker("w-b")).await.unwrap();

    let a = client.claim_leadership("w-a").await.unwrap();
    assert!(a.leader);
    let b = client.claim_leadership("w-b").await.unwrap();
    assert!(!b.leader);
    assert_eq!(b.holder.as_deref(), Some("w-a"));

    client.release_leadership("w-a").await.unwrap();
    assert!(client.claim_leadership("w-b").await.unwrap().leader);
}

#[tokio::test]
async fn relayed_heartbeats_reach_the_coordinator() {
    let coordinator = LiveCoordinator::start().await;
    let api: Arc<dyn CoordinatorApi> =
        Arc::new(CoordinatorClient::with_url(&coordinator.url).unwrap());

    api.register(&cpu_worker("w-leader")).await.unwrap();
    api.register(&cpu_worker("w-peer")).await.unwrap();
    assert!(api.claim_leadership("w-leader").await.unwrap().leader);

    let relay = Arc::new(HeartbeatRelay::new("w-leader", "default"));
    relay.set_leading(true);
    let relay_url = serve(relay::router(relay.clone())).await;

    let peer = PeerRelay::new(&relay_url, Duration::from_secs(2)).unwrap();
    let mut heartbeat = HeartbeatRequest::new(LoadMetrics::with_cpu_load(0.75));
    heartbeat.load.active_requests = 3;
    peer.send(&RelayedHeartbeat {
        worker_id: "w-peer".into(),
        heartbeat,
    })
    .await
    .unwrap();
    peer.send(&RelayedHeartbeat {
        worker_id: "w-ghost".into(),
        heartbeat: HeartbeatRequest::new(LoadMetrics::default()),
    })
    .await
    .unwrap();
    assert_eq!(relay.pending_len(), 2);

    assert_eq!(relay.flush(api.as_ref()).await.unwrap(), 2);
    let record = coordinator.state.registry.get("w-peer").unwrap();
    assert_eq!(record.load.active_requests, 3);

    // The coordinator never heard of the ghost; the relay tells it so.
    let err = peer
        .send(&RelayedHeartbeat {
            worker_id: "w-ghost".into(),
            heartbeat: HeartbeatRequest::new(LoadMetrics::default()),
        })
        .await
        .unwrap_err();
    assert!(err.is_unknown_worker());
}

#[tokio::test]
async fn relay_loses_leadership_when_coordinator_disagrees() {
    let coordinator = LiveCoordinator::start().await;
    let api = CoordinatorClient::with_url(&coordinator.url).unwrap();
    api.register(&cpu_worker("w-peer")).await.unwrap();

    // Never claimed, so the coordinator refuses the batch.
    let relay = HeartbeatRelay::new("w-peer", "default");
    relay.set_leading(true);
    relay
        .accept(RelayedHeartbeat {
            worker_id: "w-peer".into(),
            heartbeat: HeartbeatRequest::new(LoadMetrics::default()),
        })
        .unwrap();

    let err = relay.flush(&api).await.unwrap_err();
    assert!(matches!(err, AgentError::NotLeader(_)));
    assert!(!relay.is_leading());
}

struct Steady;

#[async_trait]
impl HeartbeatSource for Steady {
    async fn sample(&self) -> HeartbeatRequest {
        HeartbeatRequest::new(LoadMetrics::with_cpu_load(0.25))
    }
}

#[tokio::test]
async fn heartbeat_task_registers_beats_and_unregisters() {
    let mut config = CoordinatorConfig::default();
    config.liveness.heartbeat_interval = Duration::from_secs(1);
    let coordinator = LiveCoordinator::start_with(config).await;

    let api: Arc<dyn CoordinatorApi> =
        Arc::new(CoordinatorClient::with_url(&coordinator.url).unwrap());
    let relay = Arc::new(HeartbeatRelay::new("w-task", "default"));
    let task = HeartbeatTask::new(api, Arc::new(Steady), cpu_worker("w-task")).with_relay(relay.clone());

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(task.run(cancel.clone()));

    assert!(
        coordinator
            .wait_for(|s| s.registry.get("w-task").is_some_and(|r| r.load.cpu_load > 0.0))
            .await
    );
    assert!(relay.is_leading());
    assert!(coordinator.state.registry.get("w-task").unwrap().is_heartbeat_leader);

    cancel.cancel();
    handle.await.unwrap();

    assert!(coordinator.state.registry.get("w-task").is_none());
    assert!(!relay.is_leading());
}
