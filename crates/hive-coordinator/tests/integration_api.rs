//! Integration tests for the HTTP API.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{fixtures::WorkerBuilder, TestCoordinator};
use hive_coordinator::api::router;
use hive_proto::{
    ErrorBody, ErrorCode, HeartbeatResponse, RegisterResponse, ServiceSummary, Tier, WorkerStatus,
    WorkerSummary,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tower::ServiceExt;

async fn send(coordinator: &TestCoordinator, request: Request<Body>) -> axum::response::Response {
    router(coordinator.app_state.clone())
        .oneshot(request)
        .await
        .unwrap()
}

async fn body_json<T: DeserializeOwned>(response: axum::response::Response) -> T {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn post_json(uri: &str, value: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(value).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn register_over_http() {
    let coordinator = TestCoordinator::new();

    let response = send(
        &coordinator,
        post_json(
            "/workers",
            &json!({
                "worker_id": "w-1",
                "address": "http://10.0.0.4:8000",
                "declared_capabilities": {
                    "gpu_model": "RTX 3090",
                    "gpu_memory_mb": 24576,
                    "cpu_cores": 16
                },
                "services": [{"name": "inference", "model": "llama-8b"}]
            }),
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let registered: RegisterResponse = body_json(response).await;
    assert_eq!(registered.worker_id, "w-1");
    assert_eq!(registered.tier, Tier::Gpu);
    assert_eq!(registered.heartbeat_interval_secs, 30);
    assert!(coordinator.registry.index().contains("inference", "w-1"));
}

#[tokio::test]
async fn malformed_registration_is_rejected() {
    let coordinator = TestCoordinator::new();

    let response = send(&coordinator, post_json("/workers", &json!({"services": 7}))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ErrorBody = body_json(response).await;
    assert_eq!(body.error, ErrorCode::InvalidPayload);

    let response = send(
        &coordinator,
        post_json("/workers", &json!({"worker_id": "bad id!", "address": "10.0.0.1:80"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(coordinator.registry.is_empty());
}

#[tokio::test]
async fn heartbeat_for_unknown_worker_asks_to_register() {
    let coordinator = TestCoordinator::new();

    let response = send(
        &coordinator,
        post_json("/workers/w-404/heartbeat", &json!({"load": {"cpu_load": 0.1}})),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: ErrorBody = body_json(response).await;
    assert_eq!(body.error, ErrorCode::UnknownWorker);
    assert!(body.action.is_some());
}

#[tokio::test]
async fn heartbeat_over_http() {
    let coordinator = TestCoordinator::new();
    coordinator
        .registry
        .register(WorkerBuilder::new("w-1").with_service("rag").build())
        .await
        .unwrap();

    let response = send(
        &coordinator,
        post_json(
            "/workers/w-1/heartbeat",
            &json!({"load": {"cpu_load": 0.7, "active_requests": 2}}),
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let ack: HeartbeatResponse = body_json(response).await;
    assert!(ack.accepted);
    let record = coordinator.registry.get("w-1").unwrap();
    assert_eq!(record.load.active_requests, 2);
}

#[tokio::test]
async fn delete_worker_removes_from_all_components() {
    let coordinator = TestCoordinator::new();
    coordinator
        .registry
        .register(WorkerBuilder::new("w-1").with_service("rag").build())
        .await
        .unwrap();

    let response = send(
        &coordinator,
        Request::builder()
            .method("DELETE")
            .uri("/workers/w-1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(coordinator.registry.get("w-1").is_none());
    assert!(coordinator.registry.index().is_empty());

    let response = send(&coordinator, get("/workers/w-1")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn list_workers_reports_offline_view() {
    let coordinator = TestCoordinator::new();
    for id in ["w-1", "w-2"] {
        coordinator
            .registry
            .register(WorkerBuilder::new(id).with_service("rag").build())
            .await
            .unwrap();
    }
    tokio::time::advance(Duration::from_secs(91)).await;
    coordinator
        .registry
        .heartbeat("w-2", common::fixtures::heartbeat(0.1))
        .await
        .unwrap();

    let response = send(&coordinator, get("/workers")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let workers: Vec<WorkerSummary> = body_json(response).await;

    let statuses: Vec<_> = workers.iter().map(|w| (w.id.as_str(), w.status)).collect();
    assert_eq!(
        statuses,
        vec![("w-1", WorkerStatus::Offline), ("w-2", WorkerStatus::Healthy)]
    );

    let response = send(&coordinator, get("/services")).await;
    let services: Vec<ServiceSummary> = body_json(response).await;
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].workers, vec!["w-2"]);
}

#[tokio::test]
async fn route_forwards_path_and_names_worker() {
    let coordinator = TestCoordinator::new();
    coordinator
        .registry
        .register(WorkerBuilder::new("w-1").with_service("rag").build())
        .await
        .unwrap();

    let response = send(&coordinator, get("/route/rag/v1/query?top_k=3")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-hive-worker"], "w-1");
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(
        &body[..],
        b"GET http://w-1.workers.internal:8000/v1/query?top_k=3"
    );
}

#[tokio::test]
async fn route_to_missing_service_is_unavailable() {
    let coordinator = TestCoordinator::new();
    coordinator
        .registry
        .register(WorkerBuilder::new("w-1").with_service("rag").build())
        .await
        .unwrap();

    let response = send(&coordinator, get("/route/nonexistent")).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: ErrorBody = body_json(response).await;
    assert_eq!(body.error, ErrorCode::ServiceUnavailable);
    assert_eq!(body.available_services, Some(vec!["rag".to_string()]));
}

#[tokio::test]
async fn broadcast_over_http() {
    let coordinator = TestCoordinator::new();
    for id in ["w-1", "w-2"] {
        coordinator
            .registry
            .register(WorkerBuilder::new(id).with_service("embeddings").build())
            .await
            .unwrap();
    }

    let response = send(
        &coordinator,
        post_json("/broadcast/embeddings", &json!({"payload": {"texts": ["hi"]}})),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = body_json(response).await;
    assert_eq!(body["broadcasted_to"], 2);
    assert_eq!(body["successful"], 2);
}

#[tokio::test]
async fn leadership_over_http() {
    let coordinator = TestCoordinator::new();
    for id in ["w-1", "w-2"] {
        coordinator
            .registry
            .register(WorkerBuilder::new(id).build())
            .await
            .unwrap();
    }

    let response = send(&coordinator, post_json("/workers/w-1/leadership", &json!({}))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let claimed: serde_json::Value = body_json(response).await;
    assert_eq!(claimed["leader"], true);

    let response = send(
        &coordinator,
        post_json(
            "/heartbeats",
            &json!({"leader_id": "w-2", "group": "default", "heartbeats": []}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn health_and_readiness() {
    let coordinator = TestCoordinator::new();

    let response = send(&coordinator, get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(&coordinator, get("/ready")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = body_json(response).await;
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn metrics_render_registry_gauges() {
    let coordinator = TestCoordinator::new();
    coordinator
        .registry
        .register(WorkerBuilder::new("w-1").with_service("rag").build())
        .await
        .unwrap();

    let response = send(&coordinator, get("/metrics")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(text.contains("hive_workers{status=\"healthy\"} 1"));
    assert!(text.contains("hive_workers_by_tier{tier=\"cpu\"} 1"));
    assert!(text.contains("hive_services 1"));
    assert!(text.contains("hive_store_budget_used 1"));
}
