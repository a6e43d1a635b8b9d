//! Transport to worker-hosted services.

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use std::time::Duration;

use crate::error::{CoordinatorError, Result};

/// Request forwarded verbatim to a worker.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Path below the service prefix, with query string, e.g. `/v1/embed?x=1`.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Response from a worker.
#[derive(Debug, Clone)]
pub struct ForwardResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Sends requests to workers.
#[async_trait]
pub trait WorkerBackend: Send + Sync + std::fmt::Debug {
    /// Forwards `request` to `{base_url}{path_and_query}`.
    async fn forward(
        &self,
        base_url: &str,
        request: ForwardRequest,
        timeout: Duration,
    ) -> Result<ForwardResponse>;

    /// POSTs a job payload to `url` and returns the response status.
    async fn submit_job(&self, url: &str, payload: &serde_json::Value, timeout: Duration)
        -> Result<u16>;
}

/// HTTP backend built on a shared `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct HttpBackend {
    client: reqwest::Client,
}

impl HttpBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn transport_error(err: reqwest::Error) -> CoordinatorError {
    if err.is_timeout() {
        CoordinatorError::Timeout
    } else {
        CoordinatorError::Dispatch(err.to_string())
    }
}

#[async_trait]
impl WorkerBackend for HttpBackend {
    async fn forward(
        &self,
        base_url: &str,
        request: ForwardRequest,
        timeout: Duration,
    ) -> Result<ForwardResponse> {
        let url = format!("{base_url}{}", request.path_and_query);
        let mut headers = request.headers;
        strip_hop_by_hop(&mut headers);

        let response = self
            .client
            .request(request.method, &url)
            .headers(headers)
            .body(request.body)
            .timeout(timeout)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = response.bytes().await.map_err(transport_error)?;

        Ok(ForwardResponse {
            status,
            headers,
            body,
        })
    }

    async fn submit_job(
        &self,
        url: &str,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<u16> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(transport_error)?;
        Ok(response.status().as_u16())
    }
}

/// Removes headers that describe a single connection rather than the
/// message, plus the ones the client recomputes for the new target.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    const HOP_BY_HOP: [HeaderName; 8] = [
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
        header::HOST,
    ];

    // Headers named by `Connection` are hop-by-hop too.
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in listed {
        headers.remove(name.as_str());
    }

    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
    headers.remove(header::CONTENT_LENGTH);
}
