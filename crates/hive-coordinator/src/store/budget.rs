//! Write-budget policy in front of the key-value backend.
//!
//! The backing store allows a fixed number of writes per rolling window.
//! High-priority writes (registration, unregistration, leadership, status
//! transitions) are written synchronously and may use the reserved part of the
//! budget. Low-priority writes (heartbeat freshness, index entries) are
//! coalesced per key and flushed in the background while budget remains.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{KvStore, StoreError};
use crate::config::PersistenceConfig;

/// Write priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// State-defining write; never deferred.
    High,
    /// Freshness-only write; may be coalesced or dropped.
    Low,
}

impl Priority {
    const fn label(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Low => "low",
        }
    }
}

/// What happened to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Written to the backend.
    Written,
    /// Held in the pending map until the next flush.
    Queued,
    /// Pending map full; the value only lives in memory.
    Dropped,
}

/// Rolling-window write counter.
#[derive(Debug)]
pub struct WriteBudget {
    max_writes: usize,
    reserve: usize,
    window: Duration,
    log: Mutex<VecDeque<Instant>>,
}

impl WriteBudget {
    #[must_use]
    pub fn new(max_writes: u32, reserve: u32, window: Duration) -> Self {
        let max_writes = max_writes as usize;
        Self {
            max_writes,
            reserve: (reserve as usize).min(max_writes),
            window,
            log: Mutex::new(VecDeque::new()),
        }
    }

    /// Consumes one write if the priority's share of the budget allows it.
    pub fn try_acquire(&self, priority: Priority) -> bool {
        let now = Instant::now();
        let mut log = self.log.lock();
        self.prune(&mut log, now);

        let limit = match priority {
            Priority::High => self.max_writes,
            Priority::Low => self.max_writes - self.reserve,
        };
        if log.len() < limit {
            log.push_back(now);
            true
        } else {
            false
        }
    }

    /// Writes consumed in the current window.
    pub fn used(&self) -> usize {
        let mut log = self.log.lock();
        self.prune(&mut log, Instant::now());
        log.len()
    }

    fn prune(&self, log: &mut VecDeque<Instant>, now: Instant) {
        while log
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= self.window)
        {
            log.pop_front();
        }
    }
}

/// Snapshot of budget consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetUsage {
    pub used: usize,
    pub max_writes: usize,
    pub high_priority_reserve: usize,
    pub pending: usize,
}

/// Key-value store with a write budget.
///
/// Backend writes and deletes of the same key are serialised, so a flush in
/// flight cannot land after a delete of its key.
pub struct BudgetedStore {
    inner: Arc<dyn KvStore>,
    budget: WriteBudget,
    pending: DashMap<String, Vec<u8>>,
    key_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    max_pending: usize,
    timeout: Duration,
}

impl std::fmt::Debug for BudgetedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetedStore")
            .field("budget", &self.budget)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl BudgetedStore {
    #[must_use]
    pub fn new(inner: Arc<dyn KvStore>, config: &PersistenceConfig) -> Self {
        Self {
            inner,
            budget: WriteBudget::new(
                config.max_writes,
                config.high_priority_reserve,
                config.window,
            ),
            pending: DashMap::new(),
            key_locks: DashMap::new(),
            max_pending: config.max_pending,
            timeout: config.operation_timeout(),
        }
    }

    async fn timed<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| StoreError::Timeout)?
    }

    /// Runs `op` while holding the lock for `key`.
    async fn with_key<T, F>(&self, key: &str, op: F) -> T
    where
        F: Future<Output = T>,
    {
        let lock = self
            .key_locks
            .entry(key.to_owned())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            op.await
        };
        drop(lock);
        self.key_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    fn acquire(&self, priority: Priority) -> Result<(), StoreError> {
        if self.budget.try_acquire(priority) {
            Ok(())
        } else {
            metrics::counter!("hive_budget_exceeded_total", "priority" => priority.label())
                .increment(1);
            Err(StoreError::BudgetExceeded)
        }
    }

    /// Writes `value` under `key` according to `priority`.
    ///
    /// High priority writes synchronously or fails with
    /// [`StoreError::BudgetExceeded`]. Low priority never touches the backend
    /// inline.
    pub async fn try_write(
        &self,
        key: &str,
        value: Vec<u8>,
        priority: Priority,
    ) -> Result<WriteOutcome, StoreError> {
        match priority {
            Priority::High => {
                self.acquire(Priority::High)?;
                // Anything queued for this key is older than this value.
                self.pending.remove(key);
                self.with_key(key, self.timed(self.inner.put(key, &value)))
                    .await?;
                metrics::counter!("hive_store_writes_total", "priority" => "high").increment(1);
                Ok(WriteOutcome::Written)
            }
            Priority::Low => Ok(self.queue(key, value)),
        }
    }

    /// Queues a low-priority write for the next flush, replacing any value
    /// already queued for `key`.
    pub fn queue(&self, key: &str, value: Vec<u8>) -> WriteOutcome {
        if self.pending.contains_key(key) || self.pending.len() < self.max_pending {
            self.pending.insert(key.to_owned(), value);
            WriteOutcome::Queued
        } else {
            debug!(key, "pending write map full, dropping low-priority write");
            WriteOutcome::Dropped
        }
    }

    /// Deletes `key`. Always high priority; cancels any queued write so it
    /// cannot resurrect the key.
    pub async fn try_delete(&self, key: &str) -> Result<bool, StoreError> {
        self.pending.remove(key);
        self.acquire(Priority::High)?;
        let deleted = self
            .with_key(key, async {
                // Anything queued while waiting on the lock predates this delete.
                self.pending.remove(key);
                self.timed(self.inner.delete(key)).await
            })
            .await?;
        metrics::counter!("hive_store_writes_total", "priority" => "high").increment(1);
        Ok(deleted)
    }

    /// Atomic compare-and-swap, budgeted as a high-priority write.
    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, StoreError> {
        self.acquire(Priority::High)?;
        let swapped = self
            .timed(self.inner.compare_and_swap(key, expected, new))
            .await?;
        metrics::counter!("hive_store_writes_total", "priority" => "high").increment(1);
        Ok(swapped)
    }

    /// Reads are not budgeted.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.timed(self.inner.get(key)).await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.timed(self.inner.list(prefix)).await
    }

    /// Returns true if a low-priority write for `key` is waiting.
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Writes queued low-priority values while low-priority budget remains.
    /// Returns the number of keys written.
    pub async fn flush_pending(&self) -> usize {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut flushed = 0;

        for key in keys {
            if !self.budget.try_acquire(Priority::Low) {
                debug!(
                    remaining = self.pending.len(),
                    "low-priority budget exhausted, deferring flush"
                );
                break;
            }
            let written = self
                .with_key(&key, async {
                    // Taken under the key lock so a delete that ran first
                    // leaves nothing to write.
                    let Some((_, value)) = self.pending.remove(&key) else {
                        return None;
                    };
                    let result = self.timed(self.inner.put(&key, &value)).await;
                    if result.is_err() {
                        // A newer value may have been queued meanwhile; keep it.
                        self.pending.entry(key.clone()).or_insert(value);
                    }
                    Some(result)
                })
                .await;
            match written {
                Some(Ok(())) => {
                    flushed += 1;
                    metrics::counter!("hive_store_writes_total", "priority" => "low")
                        .increment(1);
                }
                Some(Err(e)) => warn!(key = %key, error = %e, "failed to flush pending write"),
                None => {}
            }
        }

        if flushed > 0 {
            debug!(flushed, remaining = self.pending.len(), "flushed pending writes");
        }
        flushed
    }

    /// Flushes pending writes every `interval` until cancelled, then once more.
    pub async fn run_flusher(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.flush_pending().await;
                }
            }
        }

        let flushed = self.flush_pending().await;
        info!(flushed, dropped = self.pending.len(), "store flusher stopped");
    }

    /// Budget consumption and queue depth.
    pub fn usage(&self) -> BudgetUsage {
        BudgetUsage {
            used: self.budget.used(),
            max_writes: self.budget.max_writes,
            high_priority_reserve: self.budget.reserve,
            pending: self.pending.len(),
        }
    }
}
