//! Common test utilities for coordinator integration tests.

#![allow(dead_code)]

pub mod fixtures;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use dashmap::DashMap;
use hive_coordinator::{
    api::AppState, config::RoutingConfig, CoordinatorConfig, CoordinatorError, ForwardRequest,
    ForwardResponse, KvStore, LivenessSweeper, MemoryKv, RoutingEngine, StoreError, WorkerBackend,
    WorkerRegistry,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// How the recording backend answers a job submission.
#[derive(Debug, Clone, Copy)]
pub enum JobReply {
    Status(u16),
    Unreachable,
    Hang,
}

/// Worker backend that records calls instead of doing HTTP.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    pub forwarded: Mutex<Vec<(String, ForwardRequest)>>,
    pub jobs: Mutex<Vec<String>>,
    replies: DashMap<String, JobReply>,
}

impl RecordingBackend {
    /// Sets the reply for jobs whose URL starts with `base_url`.
    pub fn reply(&self, base_url: &str, reply: JobReply) {
        self.replies.insert(base_url.to_owned(), reply);
    }

    pub fn forwarded_to(&self) -> Vec<String> {
        self.forwarded.lock().iter().map(|(url, _)| url.clone()).collect()
    }

    fn reply_for(&self, url: &str) -> JobReply {
        self.replies
            .iter()
            .find(|e| url.starts_with(e.key().as_str()))
            .map_or(JobReply::Status(202), |e| *e.value())
    }
}

#[async_trait]
impl WorkerBackend for RecordingBackend {
    async fn forward(
        &self,
        base_url: &str,
        request: ForwardRequest,
        _timeout: Duration,
    ) -> hive_coordinator::Result<ForwardResponse> {
        let echo = format!("{} {}{}", request.method, base_url, request.path_and_query);
        self.forwarded.lock().push((base_url.to_owned(), request));
        Ok(ForwardResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from(echo),
        })
    }

    async fn submit_job(
        &self,
        url: &str,
        _payload: &serde_json::Value,
        _timeout: Duration,
    ) -> hive_coordinator::Result<u16> {
        self.jobs.lock().push(url.to_owned());
        match self.reply_for(url) {
            JobReply::Status(status) => Ok(status),
            JobReply::Unreachable => Err(CoordinatorError::Dispatch("connection refused".into())),
            JobReply::Hang => {
                std::future::pending::<()>().await;
                Ok(0)
            }
        }
    }
}

/// Store whose reads and puts work but whose deletes and compare-and-swaps
/// never return, like a backend that stopped answering mid-session.
#[derive(Debug, Clone)]
pub struct StalledDeletes {
    inner: MemoryKv,
}

impl StalledDeletes {
    pub fn new(inner: MemoryKv) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl KvStore for StalledDeletes {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        std::future::pending().await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list(prefix).await
    }

    async fn compare_and_swap(
        &self,
        _key: &str,
        _expected: Option<&[u8]>,
        _new: Option<&[u8]>,
    ) -> Result<bool, StoreError> {
        std::future::pending().await
    }
}

/// Complete test coordinator with all components wired together.
pub struct TestCoordinator {
    pub kv: MemoryKv,
    pub backend: Arc<RecordingBackend>,
    pub registry: Arc<WorkerRegistry>,
    pub sweeper: Arc<LivenessSweeper>,
    pub routing: Arc<RoutingEngine>,
    pub app_state: Arc<AppState>,
}

impl TestCoordinator {
    /// Creates a test coordinator with default configuration and no jitter.
    pub fn new() -> Self {
        Self::with_config(Self::deterministic_config())
    }

    /// Default configuration with routing jitter disabled.
    pub fn deterministic_config() -> CoordinatorConfig {
        CoordinatorConfig {
            routing: RoutingConfig {
                jitter: 0.0,
                broadcast_timeout: Duration::from_secs(2),
                ..RoutingConfig::default()
            },
            ..CoordinatorConfig::default()
        }
    }

    /// Creates a test coordinator with custom configuration.
    pub fn with_config(config: CoordinatorConfig) -> Self {
        Self::with_store(config, MemoryKv::new())
    }

    /// Creates a test coordinator on top of an existing store, as after a
    /// restart.
    pub fn with_store(config: CoordinatorConfig, kv: MemoryKv) -> Self {
        let backing = Arc::new(kv.clone()) as Arc<dyn KvStore>;
        Self::with_backing(config, kv, backing)
    }

    /// Creates a test coordinator whose store calls go through `backing`,
    /// while `kv` stays available for direct inspection.
    pub fn with_backing(config: CoordinatorConfig, kv: MemoryKv, backing: Arc<dyn KvStore>) -> Self {
        let backend = Arc::new(RecordingBackend::default());
        let app_state = Arc::new(AppState::new(config, backing, backend.clone()));

        Self {
            kv,
            backend,
            registry: app_state.registry.clone(),
            sweeper: app_state.sweeper.clone(),
            routing: app_state.routing.clone(),
            app_state,
        }
    }

    /// Asserts the index and the registry agree in both directions.
    pub fn assert_index_consistent(&self) {
        let index = self.registry.index().snapshot();
        for (service, ids) in &index {
            for id in ids {
                assert!(
                    self.registry.declares(id, service),
                    "index lists {id} for {service} but the worker does not declare it"
                );
            }
        }
        for record in self.registry.snapshot() {
            for service in record.service_names() {
                assert!(
                    index.get(service).is_some_and(|ids| ids.contains(&record.id)),
                    "{} declares {service} but is missing from the index",
                    record.id
                );
            }
        }
    }
}

impl Default for TestCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
