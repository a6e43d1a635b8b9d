//! HTTP client for the coordinator API.

use std::time::Duration;

use async_trait::async_trait;
use hive_proto::{
    BatchHeartbeatRequest, BatchHeartbeatResponse, ErrorBody, HeartbeatRequest,
    HeartbeatResponse, LeadershipResponse, RegisterRequest, RegisterResponse,
};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

use crate::config::CoordinatorClientConfig;
use crate::error::{AgentError, AgentResult};

/// Coordinator operations the agent performs.
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    async fn register(&self, request: &RegisterRequest) -> AgentResult<RegisterResponse>;

    async fn heartbeat(
        &self,
        worker_id: &str,
        heartbeat: &HeartbeatRequest,
    ) -> AgentResult<HeartbeatResponse>;

    async fn unregister(&self, worker_id: &str) -> AgentResult<()>;

    async fn claim_leadership(&self, worker_id: &str) -> AgentResult<LeadershipResponse>;

    async fn release_leadership(&self, worker_id: &str) -> AgentResult<LeadershipResponse>;

    async fn batch_heartbeat(
        &self,
        batch: &BatchHeartbeatRequest,
    ) -> AgentResult<BatchHeartbeatResponse>;
}

/// HTTP client for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    client: Client,
    base_url: String,
}

impl CoordinatorClient {
    /// Create a new coordinator client from configuration.
    pub fn new(config: &CoordinatorClientConfig) -> AgentResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_owned(),
        })
    }

    /// Create a new coordinator client with a custom base URL.
    pub fn with_url(url: impl Into<String>) -> AgentResult<Self> {
        Self::new(&CoordinatorClientConfig {
            url: url.into(),
            ..CoordinatorClientConfig::default()
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl CoordinatorApi for CoordinatorClient {
    async fn register(&self, request: &RegisterRequest) -> AgentResult<RegisterResponse> {
        let url = format!("{}/workers", self.base_url);
        let response = self.client.post(&url).json(request).send().await?;
        let subject = request.worker_id.as_deref().unwrap_or("unregistered");
        parse(response, subject).await
    }

    async fn heartbeat(
        &self,
        worker_id: &str,
        heartbeat: &HeartbeatRequest,
    ) -> AgentResult<HeartbeatResponse> {
        let url = format!("{}/workers/{worker_id}/heartbeat", self.base_url);
        let response = self.client.post(&url).json(heartbeat).send().await?;
        parse(response, worker_id).await
    }

    async fn unregister(&self, worker_id: &str) -> AgentResult<()> {
        let url = format!("{}/workers/{worker_id}", self.base_url);
        let response = self.client.delete(&url).send().await?;
        parse::<serde_json::Value>(response, worker_id).await?;
        Ok(())
    }

    async fn claim_leadership(&self, worker_id: &str) -> AgentResult<LeadershipResponse> {
        let url = format!("{}/workers/{worker_id}/leadership", self.base_url);
        let response = self.client.post(&url).send().await?;
        parse(response, worker_id).await
    }

    async fn release_leadership(&self, worker_id: &str) -> AgentResult<LeadershipResponse> {
        let url = format!("{}/workers/{worker_id}/leadership", self.base_url);
        let response = self.client.delete(&url).send().await?;
        parse(response, worker_id).await
    }

    async fn batch_heartbeat(
        &self,
        batch: &BatchHeartbeatRequest,
    ) -> AgentResult<BatchHeartbeatResponse> {
        let url = format!("{}/heartbeats", self.base_url);
        let response = self.client.post(&url).json(batch).send().await?;
        parse(response, &batch.group).await
    }
}

/// Decodes a success body, or maps the error body. `subject` names the
/// worker or group the request was about.
pub(crate) async fn parse<T: DeserializeOwned>(response: Response, subject: &str) -> AgentResult<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let bytes = response.bytes().await?;
    match serde_json::from_slice::<ErrorBody>(&bytes) {
        Ok(body) => Err(AgentError::from_body(status.as_u16(), body, subject)),
        Err(_) => Err(AgentError::Coordinator {
            status: status.as_u16(),
            code: None,
            message: String::from_utf8_lossy(&bytes).into_owned(),
        }),
    }
}
