//! Heartbeat relay for heartbeat groups.
//!
//! The agent holding its group's leader slot accepts peer heartbeats on
//! `POST /relay/heartbeat`, keeps the latest one per peer and sends them to
//! the coordinator as one batch per flush interval. Peers that get no answer
//! from the relay fall back to the coordinator.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use hive_proto::{
    BatchHeartbeatRequest, BatchOutcome, ErrorBody, ErrorCode, HeartbeatRequest, RelayedHeartbeat,
};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{parse, CoordinatorApi};
use crate::error::{AgentError, AgentResult};

/// Relay state of a (potential) group leader.
#[derive(Debug)]
pub struct HeartbeatRelay {
    leader_id: String,
    group: String,
    leading: AtomicBool,
    pending: Mutex<BTreeMap<String, HeartbeatRequest>>,
    // Peers the coordinator reported unknown; told to re-register on their
    // next relayed heartbeat.
    unknown: Mutex<HashSet<String>>,
}

impl HeartbeatRelay {
    #[must_use]
    pub fn new(leader_id: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            leader_id: leader_id.into(),
            group: group.into(),
            leading: AtomicBool::new(false),
            pending: Mutex::new(BTreeMap::new()),
            unknown: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_leading(&self, leading: bool) {
        let was = self.leading.swap(leading, Ordering::SeqCst);
        if was != leading {
            info!(group = %self.group, leading, "heartbeat relay leadership changed");
        }
        if !leading {
            self.pending.lock().clear();
        }
    }

    #[must_use]
    pub fn is_leading(&self) -> bool {
        self.leading.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Queues a peer heartbeat, keeping only the newest per peer.
    pub fn accept(&self, relayed: RelayedHeartbeat) -> AgentResult<()> {
        if !self.is_leading() {
            return Err(AgentError::NotLeader(self.group.clone()));
        }
        if self.unknown.lock().remove(&relayed.worker_id) {
            return Err(AgentError::UnknownWorker(relayed.worker_id));
        }

        let mut pending = self.pending.lock();
        let newer = pending
            .get(&relayed.worker_id)
            .map_or(true, |queued| queued.sent_at <= relayed.heartbeat.sent_at);
        if newer {
            pending.insert(relayed.worker_id, relayed.heartbeat);
        }
        Ok(())
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Sends queued heartbeats as one batch. Returns the number sent.
    pub async fn flush(&self, api: &dyn CoordinatorApi) -> AgentResult<usize> {
        let drained = std::mem::take(&mut *self.pending.lock());
        if drained.is_empty() {
            return Ok(0);
        }

        let batch = BatchHeartbeatRequest {
            leader_id: self.leader_id.clone(),
            group: self.group.clone(),
            heartbeats: drained
                .iter()
                .map(|(worker_id, heartbeat)| RelayedHeartbeat {
                    worker_id: worker_id.clone(),
                    heartbeat: heartbeat.clone(),
                })
                .collect(),
        };

        match api.batch_heartbeat(&batch).await {
            Ok(response) => {
                let mut unknown = self.unknown.lock();
                for result in &response.results {
                    if result.outcome == BatchOutcome::UnknownWorker {
                        unknown.insert(result.worker_id.clone());
                    }
                }
                debug!(group = %self.group, sent = batch.heartbeats.len(), "relayed heartbeats flushed");
                Ok(batch.heartbeats.len())
            }
            Err(e @ AgentError::NotLeader(_)) => {
                // Peers fall back to the coordinator once the relay refuses them.
                self.set_leading(false);
                Err(e)
            }
            Err(e) => {
                let mut pending = self.pending.lock();
                for (worker_id, heartbeat) in drained {
                    pending.entry(worker_id).or_insert(heartbeat);
                }
                Err(e)
            }
        }
    }

    /// Flushes every `interval` until cancelled.
    pub async fn run_flusher(
        self: Arc<Self>,
        api: Arc<dyn CoordinatorApi>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.flush(api.as_ref()).await {
                        warn!(group = %self.group, error = %e, "failed to flush relayed heartbeats");
                    }
                }
            }
        }
        debug!(group = %self.group, "heartbeat relay flusher stopped");
    }
}

/// Creates the relay router.
pub fn router(relay: Arc<HeartbeatRelay>) -> Router {
    Router::new()
        .route("/relay/heartbeat", post(relay_heartbeat))
        .with_state(relay)
}

async fn relay_heartbeat(
    State(relay): State<Arc<HeartbeatRelay>>,
    payload: Result<Json<RelayedHeartbeat>, JsonRejection>,
) -> Response {
    let relayed = match payload {
        Ok(Json(relayed)) => relayed,
        Err(rejection) => {
            let body = ErrorBody::new(ErrorCode::InvalidPayload, rejection.body_text());
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };

    match relay.accept(relayed) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "queued": true }))).into_response(),
        Err(AgentError::UnknownWorker(id)) => {
            let body = ErrorBody::new(ErrorCode::UnknownWorker, format!("unknown worker: {id}"))
                .with_action("register again before sending heartbeats");
            (StatusCode::NOT_FOUND, Json(body)).into_response()
        }
        Err(_) => {
            let body = ErrorBody::new(
                ErrorCode::NotLeader,
                format!("this agent does not lead group '{}'", relay.group()),
            )
            .with_action("send heartbeats directly to the coordinator");
            (StatusCode::CONFLICT, Json(body)).into_response()
        }
    }
}

/// Client side of a peer's relay.
#[derive(Debug, Clone)]
pub struct PeerRelay {
    client: Client,
    url: String,
}

impl PeerRelay {
    /// Relay at `base_url`. Kept short so a dead relay delays heartbeats
    /// only briefly before the coordinator fallback.
    pub fn new(base_url: &str, timeout: Duration) -> AgentResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/relay/heartbeat", base_url.trim_end_matches('/')),
        })
    }

    pub async fn send(&self, relayed: &RelayedHeartbeat) -> AgentResult<()> {
        let response = self.client.post(&self.url).json(relayed).send().await?;
        parse::<serde_json::Value>(response, &relayed.worker_id).await?;
        Ok(())
    }
}
