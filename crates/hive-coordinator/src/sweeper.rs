//! Liveness sweeping.
//!
//! Runs in two modes: lazily, on every read that feeds a routing decision,
//! and as a scheduled full pass so dead workers never accumulate without
//! traffic.

use hive_proto::WorkerStatus;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::LivenessConfig;
use crate::registry::{WorkerRecord, WorkerRegistry};

/// Verdict for a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    /// Fresh enough; keep the stored status.
    Pass(WorkerStatus),
    /// Past the soft timeout; report as offline.
    Offline,
    /// Past the hard timeout; remove with full cascade.
    Delete,
}

/// Counts from a full sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub offline: usize,
    pub deleted: usize,
    /// Dangling index entries removed.
    pub healed: usize,
    /// Missing index entries restored.
    pub repaired: usize,
}

/// Applies soft/hard timeouts to the registry.
#[derive(Debug)]
pub struct LivenessSweeper {
    registry: Arc<WorkerRegistry>,
    config: LivenessConfig,
}

impl LivenessSweeper {
    #[must_use]
    pub fn new(registry: Arc<WorkerRegistry>, config: LivenessConfig) -> Self {
        Self { registry, config }
    }

    /// Classifies a worker by the age of its last heartbeat.
    pub fn sweep_one(&self, record: &WorkerRecord, now: Instant) -> SweepAction {
        let age = record.age(now);
        if age > self.config.hard_timeout {
            SweepAction::Delete
        } else if age > self.config.soft_timeout {
            SweepAction::Offline
        } else {
            SweepAction::Pass(record.status)
        }
    }

    /// The record as callers should see it: offline when silent past the
    /// soft timeout. The stored status is left alone.
    pub fn view(&self, mut record: WorkerRecord, now: Instant) -> WorkerRecord {
        if self.sweep_one(&record, now) != SweepAction::Pass(record.status) {
            record.status = WorkerStatus::Offline;
        }
        record
    }

    /// Routable workers for `service`, sorted by id.
    ///
    /// Dangling index entries are healed, expired workers deleted and offline
    /// workers skipped along the way. Only memory is touched; store cleanup
    /// of expired workers runs on the sweeper task.
    pub async fn live_candidates(&self, service: &str) -> Vec<WorkerRecord> {
        let now = Instant::now();
        let mut candidates = Vec::new();

        for id in self.registry.index().list(service) {
            let record = match self.registry.get(&id) {
                Some(record) if record.declares(service) => record,
                _ => {
                    self.registry.heal_index_entry(service, &id);
                    continue;
                }
            };

            match self.sweep_one(&record, now) {
                SweepAction::Pass(status) if status.is_routable() => candidates.push(record),
                SweepAction::Pass(_) | SweepAction::Offline => {}
                SweepAction::Delete => self.detach_expired(&id, now),
            }
        }

        candidates
    }

    /// Every worker as callers should see it, sorted by id. Expired workers
    /// are deleted instead of returned.
    pub async fn view_all(&self) -> Vec<WorkerRecord> {
        let now = Instant::now();
        let mut views = Vec::new();

        for record in self.registry.snapshot() {
            if self.sweep_one(&record, now) == SweepAction::Delete {
                self.detach_expired(&record.id, now);
                continue;
            }
            views.push(self.view(record, now));
        }

        views
    }

    /// A single worker as callers should see it.
    pub async fn view_one(&self, id: &str) -> Option<WorkerRecord> {
        let now = Instant::now();
        let record = self.registry.get(id)?;
        if self.sweep_one(&record, now) == SweepAction::Delete {
            self.detach_expired(id, now);
            return None;
        }
        Some(self.view(record, now))
    }

    /// Lazy-mode deletion: memory only, the store cleanup is queued.
    fn detach_expired(&self, id: &str, now: Instant) {
        if self.registry.detach_if_expired(id, now).is_some() {
            metrics::counter!("hive_sweeper_deletions_total", "mode" => "lazy").increment(1);
        }
    }

    /// Full pass over the registry and the index.
    pub async fn sweep(&self) -> SweepReport {
        self.registry.drain_purges().await;

        let now = Instant::now();
        let mut report = SweepReport::default();

        for record in self.registry.snapshot() {
            report.scanned += 1;
            match self.sweep_one(&record, now) {
                SweepAction::Delete => {
                    if self.registry.remove_if_expired(&record.id, now).await.is_some() {
                        report.deleted += 1;
                    }
                }
                SweepAction::Offline => report.offline += 1,
                SweepAction::Pass(_) => {}
            }
        }

        // Index entries must point at live records that declare the service.
        let live: HashSet<String> = self.registry.worker_ids().into_iter().collect();
        for (service, ids) in self.registry.index().snapshot() {
            for id in ids {
                if (!live.contains(&id) || !self.registry.declares(&id, &service))
                    && self.registry.heal_index_entry(&service, &id)
                {
                    report.healed += 1;
                }
            }
        }
        // And every declared service must be indexed.
        for id in live {
            report.repaired += self.registry.repair_index(&id);
        }

        if report.deleted > 0 {
            metrics::counter!("hive_sweeper_deletions_total", "mode" => "scheduled")
                .increment(report.deleted as u64);
        }
        if report.deleted > 0 || report.healed > 0 || report.repaired > 0 {
            info!(
                scanned = report.scanned,
                offline = report.offline,
                deleted = report.deleted,
                healed = report.healed,
                repaired = report.repaired,
                "liveness sweep"
            );
        } else {
            debug!(scanned = report.scanned, offline = report.offline, "liveness sweep");
        }
        report
    }

    /// Sweeps every `sweep_interval` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup restore settles.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                () = self.registry.purge_ready() => {
                    let purged = self.registry.drain_purges().await;
                    debug!(purged, "store cleanup of expired workers applied");
                }
            }
        }
        self.registry.drain_purges().await;
        info!("liveness sweeper stopped");
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }
}
