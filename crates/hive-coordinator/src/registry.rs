//! Worker registry: the canonical worker records and their service index.
//!
//! Every mutation of a worker's record and its index entries happens while
//! holding that worker's map entry, so per-worker changes are atomic and
//! unrelated workers never contend. Deletion removes the record and its index
//! entries together, then clears the persisted copies in the order record,
//! index, leader slot. Expiry found on the routing path only does the
//! in-memory half; the store half is queued for the sweeper task.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hive_proto::{
    BatchHeartbeatRequest, BatchHeartbeatResponse, BatchHeartbeatResult, BatchOutcome,
    DeclaredCapabilities, HeartbeatRequest, HeartbeatResponse, LeadershipResponse, LoadMetrics,
    RegisterRequest, RegisterResponse, ServiceDeclaration, ServiceHealth, Tier, WorkerStatus,
    WorkerSummary, DEFAULT_HEARTBEAT_GROUP,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::classifier::{assigned_services, classify};
use crate::config::{ClassifierConfig, CoordinatorConfig, LivenessConfig};
use crate::error::{CoordinatorError, Result};
use crate::index::ServiceIndex;
use crate::leader::HeartbeatLeader;
use crate::store::{keys, BudgetedStore, Priority, WriteOutcome};

/// Unique worker identifier.
pub type WorkerId = String;

const MAX_ID_LEN: usize = 128;

/// A registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub tier: Tier,
    /// Routable endpoint, e.g. a tunnel URL.
    pub address: String,
    pub capabilities: DeclaredCapabilities,
    /// Declared services, in declaration order.
    pub services: Vec<ServiceDeclaration>,
    /// Declared service names, or the tier role for service-less workers.
    pub assigned_services: Vec<String>,
    /// Healthy or degraded. Offline is only ever a view computed from age.
    pub status: WorkerStatus,
    pub load: LoadMetrics,
    pub heartbeat_group: String,
    pub is_heartbeat_leader: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub last_persisted_at: Option<DateTime<Utc>>,

    /// Monotonic time of the last registration or heartbeat.
    #[serde(skip, default = "Instant::now")]
    pub last_seen: Instant,
    /// Agent-side timestamp of the last applied heartbeat.
    #[serde(skip)]
    last_sent_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    persisted_status: Option<WorkerStatus>,
    #[serde(skip)]
    persisted_at: Option<Instant>,
    /// A high-priority persist failed; the next heartbeat retries it.
    #[serde(skip)]
    dirty: bool,
}

impl WorkerRecord {
    /// Returns the declaration of `service`, if the worker declares it.
    pub fn service(&self, name: &str) -> Option<&ServiceDeclaration> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Returns true if the worker declares `service`.
    pub fn declares(&self, service: &str) -> bool {
        self.service(service).is_some()
    }

    /// Names of the declared services, in declaration order.
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|s| s.name.as_str())
    }

    /// Time since the last registration or heartbeat.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    /// Admin view of the record.
    pub fn summary(&self, now: Instant) -> WorkerSummary {
        WorkerSummary {
            id: self.id.clone(),
            tier: self.tier,
            status: self.status,
            address: self.address.clone(),
            capabilities: self.capabilities.clone(),
            services: self.services.clone(),
            assigned_services: self.assigned_services.clone(),
            load: self.load.clone(),
            heartbeat_group: self.heartbeat_group.clone(),
            is_heartbeat_leader: self.is_heartbeat_leader,
            registered_at: self.registered_at,
            last_heartbeat_at: self.last_heartbeat_at,
            last_persisted_at: self.last_persisted_at,
            last_heartbeat_secs_ago: self.age(now).as_secs(),
        }
    }
}

/// Why a worker was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Unregistered,
    Expired,
}

impl RemovalReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Unregistered => "unregistered",
            Self::Expired => "expired",
        }
    }
}

/// Outcome of [`WorkerRegistry::restore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub workers: usize,
    pub expired: usize,
    pub skipped: usize,
    pub leaders: usize,
    pub services_repaired: usize,
}

/// Worker registry.
pub struct WorkerRegistry {
    records: DashMap<WorkerId, WorkerRecord>,
    index: ServiceIndex,
    leader: Arc<HeartbeatLeader>,
    store: Arc<BudgetedStore>,
    classifier: ClassifierConfig,
    liveness: LivenessConfig,
    persist_interval: Duration,
    /// Workers removed from memory whose store cleanup is still owed.
    purge_queue: Mutex<Vec<WorkerRecord>>,
    purge_ready: Notify,
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.records.len())
            .field("services", &self.index.len())
            .finish_non_exhaustive()
    }
}

impl WorkerRegistry {
    #[must_use]
    pub fn new(
        store: Arc<BudgetedStore>,
        leader: Arc<HeartbeatLeader>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            records: DashMap::new(),
            index: ServiceIndex::new(),
            leader,
            store,
            classifier: config.classifier.clone(),
            liveness: config.liveness.clone(),
            persist_interval: config.persistence.persist_interval,
            purge_queue: Mutex::new(Vec::new()),
            purge_ready: Notify::new(),
        }
    }

    /// Registers a worker, or updates it if the id is already known.
    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse> {
        validate_registration(&request)?;

        let id = request
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("w-{}", uuid::Uuid::new_v4().simple()));
        let tier = classify(&request, &self.classifier);
        let assigned = assigned_services(&request, tier);
        let group = request
            .heartbeat_group
            .clone()
            .unwrap_or_else(|| DEFAULT_HEARTBEAT_GROUP.to_owned());
        let status = derive_status(WorkerStatus::Healthy, &request.services);
        let now = Instant::now();
        let at = Utc::now();

        let (snapshot, changed, left_group, created) = match self.records.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                let old: HashSet<String> = record.service_names().map(str::to_owned).collect();
                let left_group = (record.is_heartbeat_leader && record.heartbeat_group != group)
                    .then(|| record.heartbeat_group.clone());

                record.tier = tier;
                record.address = request.address;
                record.capabilities = request.capabilities;
                record.services = request.services;
                record.assigned_services = assigned.clone();
                record.status = status;
                record.metadata = request.metadata;
                record.last_seen = now;
                record.last_heartbeat_at = at;
                record.last_sent_at = None;
                if left_group.is_some() {
                    record.is_heartbeat_leader = false;
                }
                record.heartbeat_group = group;

                let new: HashSet<String> = record.service_names().map(str::to_owned).collect();
                for service in new.difference(&old) {
                    self.index.add(service, &id);
                }
                for service in old.difference(&new) {
                    self.index.remove(service, &id);
                }
                let changed: Vec<String> = new.symmetric_difference(&old).cloned().collect();

                (record.clone(), changed, left_group, false)
            }
            Entry::Vacant(entry) => {
                let record = WorkerRecord {
                    id: id.clone(),
                    tier,
                    address: request.address,
                    capabilities: request.capabilities,
                    services: request.services,
                    assigned_services: assigned.clone(),
                    status,
                    load: LoadMetrics::default(),
                    heartbeat_group: group,
                    is_heartbeat_leader: false,
                    metadata: request.metadata,
                    registered_at: at,
                    last_heartbeat_at: at,
                    last_persisted_at: None,
                    last_seen: now,
                    last_sent_at: None,
                    persisted_status: None,
                    persisted_at: None,
                    dirty: false,
                };
                for service in record.service_names() {
                    self.index.add(service, &id);
                }
                let changed = record.service_names().map(str::to_owned).collect();
                (entry.insert(record).value().clone(), changed, None, true)
            }
        };

        self.persist_record(&snapshot, Priority::High).await;
        for service in &changed {
            self.persist_service(service).await;
        }
        if let Some(old_group) = left_group {
            if let Err(e) = self.leader.release(&old_group, &id).await {
                warn!(worker_id = %id, group = %old_group, error = %e, "failed to release leadership of previous group");
            }
        }

        metrics::counter!("hive_registrations_total").increment(1);
        info!(
            worker_id = %id,
            tier = %tier,
            services = ?snapshot.assigned_services,
            created,
            "worker registered"
        );

        Ok(RegisterResponse {
            worker_id: id,
            tier,
            assigned_services: assigned,
            heartbeat_interval_secs: self.liveness.heartbeat_interval.as_secs(),
        })
    }

    /// Applies a heartbeat.
    ///
    /// The in-memory record is always updated. The store is written only when
    /// the status changed, a previous persist failed, or `persist_interval`
    /// has elapsed since the last persist.
    pub async fn heartbeat(&self, id: &str, heartbeat: HeartbeatRequest) -> Result<HeartbeatResponse> {
        heartbeat
            .load
            .validate()
            .map_err(CoordinatorError::InvalidPayload)?;

        let now = Instant::now();
        let next_heartbeat_secs = self.liveness.heartbeat_interval.as_secs();

        let (snapshot, priority) = {
            let mut record = self
                .records
                .get_mut(id)
                .ok_or_else(|| CoordinatorError::UnknownWorker(id.to_owned()))?;

            if let (Some(sent), Some(last)) = (heartbeat.sent_at, record.last_sent_at) {
                if sent < last {
                    debug!(worker_id = id, sent_at = %sent, last_sent_at = %last, "discarding out-of-order heartbeat");
                    metrics::counter!("hive_heartbeats_total", "outcome" => "discarded")
                        .increment(1);
                    return Ok(HeartbeatResponse {
                        accepted: false,
                        next_heartbeat_secs,
                    });
                }
            }

            for report in &heartbeat.service_health {
                if let Some(service) = record.services.iter_mut().find(|s| s.name == report.name) {
                    service.health = report.health;
                }
            }
            let status = derive_status(heartbeat.status, &record.services);
            if status != record.status {
                info!(worker_id = id, from = %record.status, to = %status, "worker status changed");
            }
            record.status = status;
            record.load = heartbeat.load;
            record.last_seen = now;
            record.last_heartbeat_at = Utc::now();
            if heartbeat.sent_at.is_some() {
                record.last_sent_at = heartbeat.sent_at;
            }

            let priority = self.persist_priority(&record, now);
            (priority.map(|_| record.clone()), priority)
        };

        if let (Some(snapshot), Some(priority)) = (snapshot, priority) {
            self.persist_record(&snapshot, priority).await;
        }

        metrics::counter!("hive_heartbeats_total", "outcome" => "accepted").increment(1);
        debug!(worker_id = id, "heartbeat applied");

        Ok(HeartbeatResponse {
            accepted: true,
            next_heartbeat_secs,
        })
    }

    /// Applies heartbeats relayed by a heartbeat group leader.
    pub async fn batch_heartbeat(&self, batch: BatchHeartbeatRequest) -> Result<BatchHeartbeatResponse> {
        let is_leader = self.records.get(&batch.leader_id).is_some_and(|leader| {
            leader.is_heartbeat_leader && leader.heartbeat_group == batch.group
        });
        if !is_leader {
            return Err(CoordinatorError::NotLeader {
                worker_id: batch.leader_id,
                group: batch.group,
            });
        }

        let mut results = Vec::with_capacity(batch.heartbeats.len());
        for relayed in batch.heartbeats {
            let outcome = match self.heartbeat(&relayed.worker_id, relayed.heartbeat).await {
                Ok(ack) if ack.accepted => BatchOutcome::Accepted,
                Ok(_) => BatchOutcome::Discarded,
                Err(CoordinatorError::UnknownWorker(_)) => BatchOutcome::UnknownWorker,
                Err(_) => BatchOutcome::Invalid,
            };
            results.push(BatchHeartbeatResult {
                worker_id: relayed.worker_id,
                outcome,
            });
        }

        debug!(leader_id = %batch.leader_id, group = %batch.group, count = results.len(), "batch heartbeat applied");
        Ok(BatchHeartbeatResponse {
            results,
            next_heartbeat_secs: self.liveness.heartbeat_interval.as_secs(),
        })
    }

    /// Unregisters a worker, cascading to the index and its leader slot.
    pub async fn unregister(&self, id: &str) -> Result<WorkerRecord> {
        self.remove_where(id, RemovalReason::Unregistered, |_| true)
            .await
            .ok_or_else(|| CoordinatorError::UnknownWorker(id.to_owned()))
    }

    /// Removes a worker if it has been silent for longer than `hard_timeout`
    /// at `now`. The age check and the removal are atomic, so a heartbeat
    /// arriving concurrently either wins or is rejected as unknown.
    pub async fn remove_if_expired(&self, id: &str, now: Instant) -> Option<WorkerRecord> {
        let hard_timeout = self.liveness.hard_timeout;
        self.remove_where(id, RemovalReason::Expired, |record| {
            record.age(now) > hard_timeout
        })
        .await
    }

    /// Removes a worker from memory if it has been silent for longer than
    /// `hard_timeout`, and queues the durable cascade for
    /// [`drain_purges`](Self::drain_purges). Never touches the store.
    pub fn detach_if_expired(&self, id: &str, now: Instant) -> Option<WorkerRecord> {
        let hard_timeout = self.liveness.hard_timeout;
        let record = self.detach_where(id, |record| record.age(now) > hard_timeout)?;

        self.purge_queue.lock().push(record.clone());
        self.purge_ready.notify_one();

        metrics::counter!("hive_workers_removed_total", "reason" => RemovalReason::Expired.as_str())
            .increment(1);
        info!(worker_id = id, reason = RemovalReason::Expired.as_str(), "worker removed");
        Some(record)
    }

    /// Applies the durable cascade of every worker detached since the last
    /// drain. Returns the number of workers purged.
    pub async fn drain_purges(&self) -> usize {
        let queued = std::mem::take(&mut *self.purge_queue.lock());
        for record in &queued {
            self.purge(record).await;
        }
        queued.len()
    }

    /// Resolves once [`detach_if_expired`](Self::detach_if_expired) has
    /// queued work.
    pub async fn purge_ready(&self) {
        self.purge_ready.notified().await;
    }

    async fn remove_where<F>(&self, id: &str, reason: RemovalReason, predicate: F) -> Option<WorkerRecord>
    where
        F: FnOnce(&WorkerRecord) -> bool,
    {
        let record = self.detach_where(id, predicate)?;
        self.purge(&record).await;

        metrics::counter!("hive_workers_removed_total", "reason" => reason.as_str()).increment(1);
        info!(worker_id = id, reason = reason.as_str(), "worker removed");
        Some(record)
    }

    /// Removes the record and its index entries under the record's entry lock.
    fn detach_where<F>(&self, id: &str, predicate: F) -> Option<WorkerRecord>
    where
        F: FnOnce(&WorkerRecord) -> bool,
    {
        match self.records.entry(id.to_owned()) {
            Entry::Occupied(entry) if predicate(entry.get()) => {
                for service in entry.get().service_names() {
                    self.index.remove(service, id);
                }
                Some(entry.remove())
            }
            _ => None,
        }
    }

    /// Store side of a removal: record key, service entries, leader slot.
    async fn purge(&self, record: &WorkerRecord) {
        let id = record.id.as_str();
        if let Err(e) = self.store.try_delete(&keys::worker(id)).await {
            error!(worker_id = id, error = %e, "failed to delete persisted worker record");
        }
        for service in record.service_names() {
            self.persist_service(service).await;
        }

        // Re-registered since it was detached: its own writes win.
        let returned_as_leader = match self.records.get_mut(id) {
            Some(mut live) => {
                live.dirty = true;
                live.is_heartbeat_leader && live.heartbeat_group == record.heartbeat_group
            }
            None => false,
        };
        let holds_slot = record.is_heartbeat_leader
            || self.leader.cached_holder(&record.heartbeat_group).as_deref() == Some(id);
        if holds_slot && !returned_as_leader {
            if let Err(e) = self.leader.release(&record.heartbeat_group, id).await {
                error!(worker_id = id, group = %record.heartbeat_group, error = %e, "failed to release leader slot");
            }
        }
    }

    /// Claims the heartbeat leader slot of the worker's group.
    pub async fn claim_leadership(&self, id: &str) -> Result<LeadershipResponse> {
        let group = self.group_of(id)?;
        let outcome = self.leader.try_claim(&group, id).await?;

        if outcome.is_leader() {
            let flagged = match self.records.get_mut(id) {
                Some(mut record) if record.heartbeat_group == group => {
                    record.is_heartbeat_leader = true;
                    true
                }
                _ => false,
            };
            if !flagged {
                // Removed or moved group while claiming; give the slot back.
                if let Err(e) = self.leader.release(&group, id).await {
                    warn!(worker_id = id, group = %group, error = %e, "failed to release stale leadership claim");
                }
                return Err(CoordinatorError::UnknownWorker(id.to_owned()));
            }
            return Ok(LeadershipResponse {
                group,
                leader: true,
                holder: Some(id.to_owned()),
            });
        }

        let holder = match outcome {
            crate::leader::LeadershipOutcome::Conflict { holder } => Some(holder),
            _ => None,
        };
        Ok(LeadershipResponse {
            group,
            leader: false,
            holder,
        })
    }

    /// Releases the worker's leader slot if it holds it.
    pub async fn release_leadership(&self, id: &str) -> Result<LeadershipResponse> {
        let group = self.group_of(id)?;
        self.leader.release(&group, id).await?;
        if let Some(mut record) = self.records.get_mut(id) {
            record.is_heartbeat_leader = false;
        }

        let holder = self.leader.cached_holder(&group);
        Ok(LeadershipResponse {
            group,
            leader: false,
            holder,
        })
    }

    fn group_of(&self, id: &str) -> Result<String> {
        self.records
            .get(id)
            .map(|r| r.heartbeat_group.clone())
            .ok_or_else(|| CoordinatorError::UnknownWorker(id.to_owned()))
    }

    /// Removes `worker_id` from `service` unless the worker exists and
    /// declares the service. Returns true if a dangling entry was removed.
    pub fn heal_index_entry(&self, service: &str, worker_id: &str) -> bool {
        let healed = match self.records.entry(worker_id.to_owned()) {
            Entry::Occupied(entry) if entry.get().declares(service) => false,
            _ => self.index.remove(service, worker_id),
        };
        if healed {
            metrics::counter!("hive_dangling_index_entries_total").increment(1);
            warn!(service, worker_id, "removed dangling service index entry");
        }
        healed
    }

    /// Re-adds any declared service of `worker_id` missing from the index.
    /// Returns the number of entries added.
    pub fn repair_index(&self, worker_id: &str) -> usize {
        let Some(record) = self.records.get(worker_id) else {
            return 0;
        };
        let mut added = 0;
        for service in record.service_names() {
            if self.index.add(service, worker_id) {
                added += 1;
            }
        }
        drop(record);

        if added > 0 {
            warn!(worker_id, added, "restored missing service index entries");
        }
        added
    }

    /// Loads persisted records, rebuilds the index from them and reconciles
    /// persisted index entries and leader slots.
    pub async fn restore(&self) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();
        let now = Instant::now();
        let wall = Utc::now();

        for key in self.store.list(keys::WORKERS).await? {
            let Some(bytes) = self.store.get(&key).await? else {
                continue;
            };
            let mut record: WorkerRecord = match serde_json::from_slice(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping unreadable worker record");
                    report.skipped += 1;
                    continue;
                }
            };

            let age = (wall - record.last_heartbeat_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age > self.liveness.hard_timeout {
                if let Err(e) = self.store.try_delete(&key).await {
                    warn!(key = %key, error = %e, "failed to delete expired worker record");
                }
                report.expired += 1;
                continue;
            }

            record.last_seen = now.checked_sub(age).unwrap_or(now);
            record.last_sent_at = None;
            record.persisted_status = Some(record.status);
            record.persisted_at = Some(now);
            record.dirty = false;
            record.is_heartbeat_leader = false;

            let id = record.id.clone();
            match self.records.entry(id.clone()) {
                // Re-registered before restore finished; the live record wins.
                Entry::Occupied(_) => continue,
                Entry::Vacant(entry) => {
                    for service in record.service_names() {
                        self.index.add(service, &id);
                    }
                    entry.insert(record);
                }
            }
            report.workers += 1;
        }

        report.leaders = self.restore_leaders().await?;
        report.services_repaired = self.reconcile_services().await?;

        info!(
            workers = report.workers,
            expired = report.expired,
            skipped = report.skipped,
            leaders = report.leaders,
            services_repaired = report.services_repaired,
            "registry restored"
        );
        Ok(report)
    }

    async fn restore_leaders(&self) -> Result<usize> {
        let mut groups: BTreeSet<String> = self
            .records
            .iter()
            .map(|r| r.heartbeat_group.clone())
            .collect();
        for key in self.store.list(keys::LEADER).await? {
            if let Some(group) = key.strip_prefix(keys::LEADER) {
                groups.insert(group.to_owned());
            }
        }

        let mut leaders = 0;
        for group in groups {
            let Some(holder) = self.leader.holder(&group).await? else {
                continue;
            };
            let flagged = match self.records.get_mut(&holder) {
                Some(mut record) if record.heartbeat_group == group => {
                    record.is_heartbeat_leader = true;
                    true
                }
                _ => false,
            };
            if flagged {
                leaders += 1;
            } else {
                warn!(group = %group, holder = %holder, "releasing leader slot held by unknown worker");
                self.leader.release(&group, &holder).await?;
            }
        }
        Ok(leaders)
    }

    async fn reconcile_services(&self) -> Result<usize> {
        let live = self.index.snapshot();
        let mut repaired = 0;
        let mut persisted = BTreeSet::new();

        for key in self.store.list(keys::SERVICES).await? {
            let Some(name) = key.strip_prefix(keys::SERVICES) else {
                continue;
            };
            persisted.insert(name.to_owned());

            let stored: Option<Vec<WorkerId>> = self
                .store
                .get(&key)
                .await?
                .and_then(|bytes| serde_json::from_slice(&bytes).ok());
            if stored.as_ref() != live.get(name) {
                self.persist_service(name).await;
                repaired += 1;
            }
        }

        for name in live.keys().filter(|name| !persisted.contains(*name)) {
            self.persist_service(name).await;
            repaired += 1;
        }
        Ok(repaired)
    }

    fn persist_priority(&self, record: &WorkerRecord, now: Instant) -> Option<Priority> {
        if record.dirty || record.persisted_status != Some(record.status) {
            return Some(Priority::High);
        }
        let due = record
            .persisted_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.persist_interval);
        due.then_some(Priority::Low)
    }

    async fn persist_record(&self, record: &WorkerRecord, priority: Priority) {
        let at = Utc::now();
        let mut persisted = record.clone();
        persisted.last_persisted_at = Some(at);
        let bytes = match serde_json::to_vec(&persisted) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(worker_id = %record.id, error = %e, "failed to serialise worker record");
                return;
            }
        };

        let key = keys::worker(&record.id);
        if priority == Priority::Low {
            // Queued under the entry lock: a removal either runs first and
            // nothing is queued, or runs after and its delete cancels this.
            let Some(mut live) = self.records.get_mut(&record.id) else {
                return;
            };
            if self.store.queue(&key, bytes) == WriteOutcome::Queued {
                live.persisted_status = Some(record.status);
                live.persisted_at = Some(Instant::now());
                live.last_persisted_at = Some(at);
            }
            return;
        }

        match self.store.try_write(&key, bytes, priority).await {
            Ok(WriteOutcome::Written | WriteOutcome::Queued) => {
                if let Some(mut live) = self.records.get_mut(&record.id) {
                    live.persisted_status = Some(record.status);
                    live.persisted_at = Some(Instant::now());
                    live.last_persisted_at = Some(at);
                    live.dirty = false;
                } else {
                    // Removed while the write was in flight.
                    if let Err(e) = self.store.try_delete(&key).await {
                        warn!(worker_id = %record.id, error = %e, "failed to delete record of removed worker");
                    }
                }
            }
            Ok(WriteOutcome::Dropped) => {}
            Err(e) => {
                error!(worker_id = %record.id, error = %e, "failed to persist worker record");
                if let Some(mut live) = self.records.get_mut(&record.id) {
                    live.dirty = true;
                }
            }
        }
    }

    async fn persist_service(&self, service: &str) {
        let ids = self.index.list(service);
        let key = keys::service(service);

        let result = if ids.is_empty() {
            self.store.try_delete(&key).await.map(|_| ())
        } else {
            match serde_json::to_vec(&ids) {
                Ok(bytes) => self.store.try_write(&key, bytes, Priority::Low).await.map(|_| ()),
                Err(e) => {
                    error!(service, error = %e, "failed to serialise service entry");
                    return;
                }
            }
        };

        if let Err(e) = result {
            warn!(service, error = %e, "failed to persist service entry");
        }
    }

    /// Gets a copy of a worker's record.
    pub fn get(&self, id: &str) -> Option<WorkerRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    /// Returns true if the worker exists and declares `service`.
    pub fn declares(&self, id: &str, service: &str) -> bool {
        self.records.get(id).is_some_and(|r| r.declares(service))
    }

    /// Copies of all records, sorted by id.
    pub fn snapshot(&self) -> Vec<WorkerRecord> {
        let mut records: Vec<WorkerRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Ids of all registered workers, unsorted.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.records.iter().map(|r| r.key().clone()).collect()
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The service index kept in step with the records.
    pub const fn index(&self) -> &ServiceIndex {
        &self.index
    }

    /// Heartbeat leader slots.
    pub fn leader(&self) -> &Arc<HeartbeatLeader> {
        &self.leader
    }

    /// The budgeted store records are persisted through.
    pub fn store(&self) -> &Arc<BudgetedStore> {
        &self.store
    }

    pub const fn liveness(&self) -> &LivenessConfig {
        &self.liveness
    }
}

/// Status from the agent's report and per-service health.
fn derive_status(reported: WorkerStatus, services: &[ServiceDeclaration]) -> WorkerStatus {
    let services_healthy = services.iter().all(|s| s.health == ServiceHealth::Healthy);
    if services_healthy && reported == WorkerStatus::Healthy {
        WorkerStatus::Healthy
    } else {
        WorkerStatus::Degraded
    }
}

fn validate_id(kind: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value.len() <= MAX_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CoordinatorError::InvalidPayload(format!(
            "{kind} must be 1-{MAX_ID_LEN} characters of [A-Za-z0-9._-], got {value:?}"
        )))
    }
}

fn validate_registration(request: &RegisterRequest) -> Result<()> {
    if request.address.trim().is_empty() {
        return Err(CoordinatorError::InvalidPayload(
            "address must not be empty".to_owned(),
        ));
    }
    if let Some(id) = &request.worker_id {
        validate_id("worker_id", id)?;
    }
    if let Some(group) = &request.heartbeat_group {
        validate_id("heartbeat_group", group)?;
    }
    request
        .capabilities
        .validate()
        .map_err(CoordinatorError::InvalidPayload)?;

    let mut seen = HashSet::new();
    for service in &request.services {
        validate_id("service name", &service.name)?;
        if !seen.insert(service.name.as_str()) {
            return Err(CoordinatorError::InvalidPayload(format!(
                "service {:?} declared twice",
                service.name
            )));
        }
    }
    Ok(())
}
