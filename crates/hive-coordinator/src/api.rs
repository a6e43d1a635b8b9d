//! HTTP API for workers, operators and routed traffic.

use axum::{
    body::{Body, Bytes},
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use hive_proto::headers::{REQUIRED_MODEL, SERVED_BY, SPECIALIZATION};
use hive_proto::{
    BatchHeartbeatRequest, BatchHeartbeatResponse, BroadcastRequest, BroadcastResponse, HeartbeatRequest,
    HeartbeatResponse, LeadershipResponse, RegisterRequest, RegisterResponse, RouteHints,
    ServiceSummary, Tier, UnregisterResponse, WorkerStatus, WorkerSummary,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::leader::HeartbeatLeader;
use crate::registry::WorkerRegistry;
use crate::routing::{ForwardRequest, RoutingEngine, WorkerBackend};
use crate::store::{keys, BudgetedStore, KvStore};
use crate::sweeper::LivenessSweeper;

/// Shared application state.
pub struct AppState {
    pub config: CoordinatorConfig,
    pub store: Arc<BudgetedStore>,
    pub registry: Arc<WorkerRegistry>,
    pub sweeper: Arc<LivenessSweeper>,
    pub routing: Arc<RoutingEngine>,
    pub prometheus: Option<PrometheusHandle>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("registry", &self.registry)
            .field("store", &self.store)
            .field("prometheus", &self.prometheus.is_some())
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Wires the coordinator components on top of `kv` and `backend`.
    #[must_use]
    pub fn new(
        config: CoordinatorConfig,
        kv: Arc<dyn KvStore>,
        backend: Arc<dyn WorkerBackend>,
    ) -> Self {
        let store = Arc::new(BudgetedStore::new(kv, &config.persistence));
        let leader = Arc::new(HeartbeatLeader::new(store.clone(), config.leader.clone()));
        let registry = Arc::new(WorkerRegistry::new(store.clone(), leader, &config));
        let sweeper = Arc::new(LivenessSweeper::new(
            registry.clone(),
            config.liveness.clone(),
        ));
        let routing = Arc::new(RoutingEngine::new(
            sweeper.clone(),
            backend,
            config.routing.clone(),
        ));

        Self {
            config,
            store,
            registry,
            sweeper,
            routing,
            prometheus: None,
        }
    }

    #[must_use]
    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }
}

/// Creates the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        // Worker lifecycle
        .route("/workers", post(register).get(list_workers))
        .route("/workers/{id}", get(get_worker).delete(unregister))
        .route("/workers/{id}/heartbeat", post(heartbeat))
        .route(
            "/workers/{id}/leadership",
            post(claim_leadership).delete(release_leadership),
        )
        .route("/heartbeats", post(batch_heartbeat))
        // Discovery and routing
        .route("/services", get(list_services))
        .route("/route/{service}", any(route_service))
        .route("/route/{service}/{*path}", any(route_service_path))
        .route("/broadcast/{capability}", post(broadcast))
        // Metrics
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse { status: "healthy" })
}

/// Ready once the store answers a read.
async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let workers = state.registry.len();
    match state.store.get(&keys::leader("readiness-probe")).await {
        Ok(_) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                workers,
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "readiness probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadyResponse {
                    ready: false,
                    workers,
                }),
            )
        }
    }
}

async fn register(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterResponse>)> {
    let Json(request) = payload?;
    let response = state.registry.register(request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn list_workers(State(state): State<Arc<AppState>>) -> Json<Vec<WorkerSummary>> {
    let now = Instant::now();
    let workers = state.sweeper.view_all().await;
    Json(workers.iter().map(|w| w.summary(now)).collect())
}

async fn get_worker(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<WorkerSummary>> {
    let worker = state
        .sweeper
        .view_one(&id)
        .await
        .ok_or(CoordinatorError::UnknownWorker(id))?;
    Ok(Json(worker.summary(Instant::now())))
}

async fn unregister(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<UnregisterResponse>> {
    state.registry.unregister(&id).await?;
    Ok(Json(UnregisterResponse { ack: true }))
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<Json<HeartbeatResponse>> {
    let Json(request) = payload?;
    Ok(Json(state.registry.heartbeat(&id, request).await?))
}

async fn claim_leadership(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<LeadershipResponse>> {
    Ok(Json(state.registry.claim_leadership(&id).await?))
}

async fn release_leadership(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<LeadershipResponse>> {
    Ok(Json(state.registry.release_leadership(&id).await?))
}

async fn batch_heartbeat(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<BatchHeartbeatRequest>, JsonRejection>,
) -> Result<Json<BatchHeartbeatResponse>> {
    let Json(request) = payload?;
    Ok(Json(state.registry.batch_heartbeat(request).await?))
}

/// Services with at least one live worker.
async fn list_services(State(state): State<Arc<AppState>>) -> Json<Vec<ServiceSummary>> {
    let mut services = Vec::new();
    for service_name in state.registry.index().services() {
        let workers: Vec<String> = state
            .sweeper
            .live_candidates(&service_name)
            .await
            .into_iter()
            .map(|w| w.id)
            .collect();
        if !workers.is_empty() {
            services.push(ServiceSummary {
                service_name,
                worker_count: workers.len(),
                workers,
            });
        }
    }
    Json(services)
}

async fn route_service(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    forward(&state, &service, "", method, &uri, headers, body).await
}

async fn route_service_path(
    State(state): State<Arc<AppState>>,
    Path((service, path)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    forward(&state, &service, &path, method, &uri, headers, body).await
}

async fn forward(
    state: &AppState,
    service: &str,
    path: &str,
    method: Method,
    uri: &Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let hints = hints_from_headers(&headers);
    let mut path_and_query = format!("/{}", path.trim_start_matches('/'));
    if let Some(query) = uri.query() {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }

    let request = ForwardRequest {
        method,
        path_and_query,
        headers,
        body,
    };
    let (selection, upstream) = state.routing.route(service, &hints, request).await?;

    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = upstream.headers;
    if let Ok(worker) = HeaderValue::from_str(&selection.worker.id) {
        response.headers_mut().insert(SERVED_BY, worker);
    }
    Ok(response)
}

fn hints_from_headers(headers: &HeaderMap) -> RouteHints {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
    };
    RouteHints {
        required_model: value(REQUIRED_MODEL),
        specialization: value(SPECIALIZATION),
    }
}

async fn broadcast(
    State(state): State<Arc<AppState>>,
    Path(capability): Path<String>,
    payload: std::result::Result<Json<BroadcastRequest>, JsonRejection>,
) -> Result<Json<BroadcastResponse>> {
    let Json(request) = payload?;
    let response = state
        .routing
        .broadcast(&capability, &request.payload, request.max_tier)
        .await?;
    Ok(Json(response))
}

/// Prometheus text: registry gauges, then the recorder's output.
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let workers = state.sweeper.view_all().await;

    let mut by_status: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut by_tier: BTreeMap<&'static str, usize> = BTreeMap::new();
    for status in [WorkerStatus::Healthy, WorkerStatus::Degraded, WorkerStatus::Offline] {
        by_status.insert(status_label(status), 0);
    }
    for tier in [Tier::Gpu, Tier::Cpu, Tier::Storage, Tier::Edge] {
        by_tier.insert(tier.as_str(), 0);
    }
    for worker in &workers {
        *by_status.entry(status_label(worker.status)).or_default() += 1;
        *by_tier.entry(worker.tier.as_str()).or_default() += 1;
    }
    let usage = state.store.usage();

    let mut out = String::from(
        "# HELP hive_workers Registered workers by status\n# TYPE hive_workers gauge\n",
    );
    for (status, count) in &by_status {
        out.push_str(&format!("hive_workers{{status=\"{status}\"}} {count}\n"));
    }
    out.push_str("\n# HELP hive_workers_by_tier Registered workers by tier\n# TYPE hive_workers_by_tier gauge\n");
    for (tier, count) in &by_tier {
        out.push_str(&format!("hive_workers_by_tier{{tier=\"{tier}\"}} {count}\n"));
    }
    out.push_str(&format!(
        "\n# HELP hive_services Services with at least one indexed worker\n\
         # TYPE hive_services gauge\n\
         hive_services {}\n\n\
         # HELP hive_store_budget_used Store writes used in the current window\n\
         # TYPE hive_store_budget_used gauge\n\
         hive_store_budget_used {}\n\n\
         # HELP hive_store_budget_max Store writes allowed per window\n\
         # TYPE hive_store_budget_max gauge\n\
         hive_store_budget_max {}\n\n\
         # HELP hive_store_pending_writes Low-priority writes waiting for a flush\n\
         # TYPE hive_store_pending_writes gauge\n\
         hive_store_pending_writes {}\n",
        state.registry.index().len(),
        usage.used,
        usage.max_writes,
        usage.pending,
    ));

    if let Some(handle) = &state.prometheus {
        out.push('\n');
        out.push_str(&handle.render());
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        out,
    )
}

const fn status_label(status: WorkerStatus) -> &'static str {
    match status {
        WorkerStatus::Healthy => "healthy",
        WorkerStatus::Degraded => "degraded",
        WorkerStatus::Offline => "offline",
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    ready: bool,
    workers: usize,
}
