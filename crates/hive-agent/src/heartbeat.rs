//! Registration and heartbeat loop.

use std::sync::Arc;
use std::time::Duration;

use hive_proto::{RegisterRequest, RelayedHeartbeat};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::CoordinatorApi;
use crate::error::{AgentError, AgentResult};
use crate::probe::HeartbeatSource;
use crate::relay::{HeartbeatRelay, PeerRelay};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Ticks between leadership claims while another agent holds the slot.
const RECLAIM_EVERY: u32 = 10;

/// Keeps one worker registered until cancelled.
pub struct HeartbeatTask {
    api: Arc<dyn CoordinatorApi>,
    source: Arc<dyn HeartbeatSource>,
    registration: RegisterRequest,
    worker_id: String,
    relay: Option<Arc<HeartbeatRelay>>,
    peer: Option<PeerRelay>,
}

impl std::fmt::Debug for HeartbeatTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatTask")
            .field("worker_id", &self.worker_id)
            .field("relay", &self.relay.is_some())
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl HeartbeatTask {
    #[must_use]
    pub fn new(
        api: Arc<dyn CoordinatorApi>,
        source: Arc<dyn HeartbeatSource>,
        registration: RegisterRequest,
    ) -> Self {
        let worker_id = registration.worker_id.clone().unwrap_or_default();
        Self {
            api,
            source,
            registration,
            worker_id,
            relay: None,
            peer: None,
        }
    }

    /// Claims the group's leader slot and feeds `relay` while holding it.
    #[must_use]
    pub fn with_relay(mut self, relay: Arc<HeartbeatRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Sends heartbeats through a peer's relay first.
    #[must_use]
    pub fn with_peer(mut self, peer: PeerRelay) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Registers, heartbeats on the interval the coordinator hands out, and
    /// unregisters once `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let Some(mut interval) = self.register(&cancel).await else {
            return;
        };
        self.claim_leadership().await;

        let mut ticker = new_ticker(interval);
        let mut ticks_since_claim = 0u32;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.beat().await {
                Ok(()) => {}
                Err(e) if e.is_unknown_worker() => {
                    warn!(worker_id = %self.worker_id, "coordinator lost this worker, registering again");
                    let Some(next) = self.register(&cancel).await else {
                        break;
                    };
                    if next != interval {
                        interval = next;
                        ticker = new_ticker(interval);
                    }
                    self.claim_leadership().await;
                    ticks_since_claim = 0;
                }
                Err(e) => warn!(worker_id = %self.worker_id, error = %e, "heartbeat failed"),
            }

            if self.relay.as_ref().is_some_and(|r| !r.is_leading()) {
                ticks_since_claim += 1;
                if ticks_since_claim >= RECLAIM_EVERY {
                    self.claim_leadership().await;
                    ticks_since_claim = 0;
                }
            }
        }

        self.shutdown().await;
    }

    /// Registers until accepted. Returns the heartbeat interval, or `None`
    /// if cancelled first.
    async fn register(&mut self, cancel: &CancellationToken) -> Option<Duration> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.api.register(&self.registration).await {
                Ok(response) => {
                    info!(
                        worker_id = %response.worker_id,
                        tier = %response.tier.as_str(),
                        services = ?response.assigned_services,
                        "registered with coordinator"
                    );
                    self.worker_id.clone_from(&response.worker_id);
                    self.registration.worker_id = Some(response.worker_id);
                    return Some(Duration::from_secs(response.heartbeat_interval_secs.max(1)));
                }
                Err(e) => {
                    warn!(error = %e, retry_in_secs = backoff.as_secs(), "registration failed");
                    tokio::select! {
                        () = cancel.cancelled() => return None,
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn beat(&self) -> AgentResult<()> {
        let heartbeat = self.source.sample().await;

        let leading = self.relay.as_ref().is_some_and(|r| r.is_leading());
        if let (Some(peer), false) = (&self.peer, leading) {
            let relayed = RelayedHeartbeat {
                worker_id: self.worker_id.clone(),
                heartbeat: heartbeat.clone(),
            };
            match peer.send(&relayed).await {
                Ok(()) => return Ok(()),
                Err(e @ AgentError::UnknownWorker(_)) => return Err(e),
                Err(e) => debug!(error = %e, "relay unavailable, sending heartbeat directly"),
            }
        }

        let ack = self.api.heartbeat(&self.worker_id, &heartbeat).await?;
        if !ack.accepted {
            debug!(worker_id = %self.worker_id, "coordinator discarded out-of-order heartbeat");
        }
        Ok(())
    }

    async fn claim_leadership(&self) {
        let Some(relay) = &self.relay else {
            return;
        };
        match self.api.claim_leadership(&self.worker_id).await {
            Ok(response) => {
                relay.set_leading(response.leader);
                debug!(
                    worker_id = %self.worker_id,
                    group = %response.group,
                    leader = response.leader,
                    holder = ?response.holder,
                    "leadership claim answered"
                );
            }
            Err(e) => {
                relay.set_leading(false);
                warn!(worker_id = %self.worker_id, error = %e, "leadership claim failed");
            }
        }
    }

    async fn shutdown(&self) {
        if let Some(relay) = self.relay.as_ref().filter(|r| r.is_leading()) {
            relay.set_leading(false);
            if let Err(e) = self.api.release_leadership(&self.worker_id).await {
                warn!(worker_id = %self.worker_id, error = %e, "failed to release leadership");
            }
        }
        match self.api.unregister(&self.worker_id).await {
            Ok(()) => info!(worker_id = %self.worker_id, "unregistered from coordinator"),
            Err(e) => warn!(worker_id = %self.worker_id, error = %e, "failed to unregister"),
        }
    }
}

fn new_ticker(interval: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hive_proto::{
        BatchHeartbeatRequest, BatchHeartbeatResponse, HeartbeatRequest, HeartbeatResponse,
        LeadershipResponse, LoadMetrics, RegisterResponse, Tier,
    };
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Register,
        Heartbeat(String),
        Unregister(String),
        Claim(String),
        Release(String),
    }

    /// Coordinator double scripted per call kind.
    #[derive(Default)]
    struct FakeCoordinator {
        calls: Mutex<Vec<Call>>,
        failing_registrations: Mutex<u32>,
        forget_worker: Mutex<bool>,
        grant_leadership: bool,
    }

    impl FakeCoordinator {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
            self.calls.lock().iter().filter(|c| matches(c)).count()
        }
    }

    #[async_trait]
    impl CoordinatorApi for FakeCoordinator {
        async fn register(&self, request: &RegisterRequest) -> AgentResult<RegisterResponse> {
            self.calls.lock().push(Call::Register);
            {
                let mut failing = self.failing_registrations.lock();
                if *failing > 0 {
                    *failing -= 1;
                    return Err(AgentError::Coordinator {
                        status: 503,
                        code: None,
                        message: "unavailable".into(),
                    });
                }
            }
            Ok(RegisterResponse {
                worker_id: request.worker_id.clone().unwrap_or_else(|| "w-generated".into()),
                tier: Tier::Cpu,
                assigned_services: vec!["compute".into()],
                heartbeat_interval_secs: 30,
            })
        }

        async fn heartbeat(
            &self,
            worker_id: &str,
            _: &HeartbeatRequest,
        ) -> AgentResult<HeartbeatResponse> {
            self.calls.lock().push(Call::Heartbeat(worker_id.to_owned()));
            if std::mem::take(&mut *self.forget_worker.lock()) {
                return Err(AgentError::UnknownWorker(worker_id.to_owned()));
            }
            Ok(HeartbeatResponse {
                accepted: true,
                next_heartbeat_secs: 30,
            })
        }

        async fn unregister(&self, worker_id: &str) -> AgentResult<()> {
            self.calls.lock().push(Call::Unregister(worker_id.to_owned()));
            Ok(())
        }

        async fn claim_leadership(&self, worker_id: &str) -> AgentResult<LeadershipResponse> {
            self.calls.lock().push(Call::Claim(worker_id.to_owned()));
            Ok(LeadershipResponse {
                group: "default".into(),
                leader: self.grant_leadership,
                holder: Some(if self.grant_leadership { worker_id } else { "w-other" }.to_owned()),
            })
        }

        async fn release_leadership(&self, worker_id: &str) -> AgentResult<LeadershipResponse> {
            self.calls.lock().push(Call::Release(worker_id.to_owned()));
            Ok(LeadershipResponse {
                group: "default".into(),
                leader: false,
                holder: None,
            })
        }

        async fn batch_heartbeat(
            &self,
            _: &BatchHeartbeatRequest,
        ) -> AgentResult<BatchHeartbeatResponse> {
            unimplemented!()
        }
    }

    struct IdleHost;

    #[async_trait]
    impl HeartbeatSource for IdleHost {
        async fn sample(&self) -> HeartbeatRequest {
            HeartbeatRequest::new(LoadMetrics::with_cpu_load(0.1))
        }
    }

    fn task(api: Arc<FakeCoordinator>) -> HeartbeatTask {
        let registration =
            RegisterRequest::new("http://10.0.0.9:8000").with_worker_id("w-0123456789abcdef");
        HeartbeatTask::new(api, Arc::new(IdleHost), registration)
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_on_interval_and_unregisters_on_shutdown() {
        let api = Arc::new(FakeCoordinator::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task(api.clone()).run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(95)).await;
        cancel.cancel();
        handle.await.unwrap();

        let id = "w-0123456789abcdef".to_owned();
        assert_eq!(
            api.calls(),
            vec![
                Call::Register,
                Call::Heartbeat(id.clone()),
                Call::Heartbeat(id.clone()),
                Call::Heartbeat(id.clone()),
                Call::Unregister(id),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn registration_retries_with_backoff() {
        let api = Arc::new(FakeCoordinator::default());
        *api.failing_registrations.lock() = 3;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task(api.clone()).run(cancel.clone()));

        // Retries after 1s, 2s and 4s.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(api.count(|c| *c == Call::Register), 3);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(api.count(|c| *c == Call::Register), 4);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_registration_skips_unregister() {
        let api = Arc::new(FakeCoordinator::default());
        *api.failing_registrations.lock() = u32::MAX;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task(api.clone()).run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(api.count(|c| matches!(c, Call::Unregister(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_worker_triggers_re_registration() {
        let api = Arc::new(FakeCoordinator::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task(api.clone()).run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(35)).await;
        *api.forget_worker.lock() = true;
        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(api.count(|c| *c == Call::Register), 2);
        assert_eq!(api.count(|c| matches!(c, Call::Heartbeat(_))), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn coordinator_assigned_id_is_adopted() {
        let api = Arc::new(FakeCoordinator::default());
        let cancel = CancellationToken::new();
        let task = HeartbeatTask::new(
            api.clone(),
            Arc::new(IdleHost),
            RegisterRequest::new("http://10.0.0.9:8000"),
        );
        let handle = tokio::spawn(task.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(31)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(api.calls().contains(&Call::Heartbeat("w-generated".into())));
        assert!(api.calls().contains(&Call::Unregister("w-generated".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn relay_leader_claims_and_releases() {
        let api = Arc::new(FakeCoordinator {
            grant_leadership: true,
            ..FakeCoordinator::default()
        });
        let relay = Arc::new(HeartbeatRelay::new("w-0123456789abcdef", "default"));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task(api.clone()).with_relay(relay.clone()).run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(relay.is_leading());

        cancel.cancel();
        handle.await.unwrap();

        assert!(!relay.is_leading());
        let calls = api.calls();
        let release = calls.iter().position(|c| matches!(c, Call::Release(_))).unwrap();
        let unregister = calls.iter().position(|c| matches!(c, Call::Unregister(_))).unwrap();
        assert!(release < unregister);
    }

    #[tokio::test(start_paused = true)]
    async fn follower_reclaims_periodically() {
        let api = Arc::new(FakeCoordinator::default());
        let relay = Arc::new(HeartbeatRelay::new("w-0123456789abcdef", "default"));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task(api.clone()).with_relay(relay.clone()).run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(30 * u64::from(RECLAIM_EVERY) + 5)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(!relay.is_leading());
        assert_eq!(api.count(|c| matches!(c, Call::Claim(_))), 2);
        assert_eq!(api.count(|c| matches!(c, Call::Release(_))), 0);
    }
}
