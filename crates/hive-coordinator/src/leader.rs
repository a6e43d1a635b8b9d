//! Heartbeat leader election.
//!
//! One slot per heartbeat group, stored under `leader/{group}`. Claims and
//! releases are single compare-and-swap operations against the store, never a
//! read followed by a conditional write.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::LeaderConfig;
use crate::error::{CoordinatorError, Result};
use crate::registry::WorkerId;
use crate::store::{keys, BudgetedStore, StoreError};

/// Result of a leadership claim. Losing is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipOutcome {
    /// The slot was empty and now holds the caller.
    Claimed,
    /// The caller already held the slot.
    AlreadyLeader,
    /// Another worker holds the slot.
    Conflict { holder: WorkerId },
}

impl LeadershipOutcome {
    /// Returns true if the caller holds the slot.
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        matches!(self, Self::Claimed | Self::AlreadyLeader)
    }
}

/// Per-group leader slots.
#[derive(Debug)]
pub struct HeartbeatLeader {
    store: Arc<BudgetedStore>,
    config: LeaderConfig,
    /// Last known holder per group.
    holders: DashMap<String, WorkerId>,
}

impl HeartbeatLeader {
    #[must_use]
    pub fn new(store: Arc<BudgetedStore>, config: LeaderConfig) -> Self {
        Self {
            store,
            config,
            holders: DashMap::new(),
        }
    }

    /// Attempts to claim `group`'s slot for `worker_id`.
    ///
    /// Each attempt is one compare-and-swap bounded by `claim_timeout`.
    /// Timeouts and transient store errors are retried up to
    /// `claim_attempts` times.
    pub async fn try_claim(&self, group: &str, worker_id: &str) -> Result<LeadershipOutcome> {
        let key = keys::leader(group);
        let mut last_error = CoordinatorError::Timeout;

        for attempt in 1..=self.config.claim_attempts {
            let cas = tokio::time::timeout(
                self.config.claim_timeout(),
                self.store
                    .compare_and_swap(&key, None, Some(worker_id.as_bytes())),
            )
            .await;

            match cas {
                Ok(Ok(true)) => {
                    self.holders.insert(group.to_owned(), worker_id.to_owned());
                    info!(group, worker_id, "heartbeat leadership claimed");
                    return Ok(LeadershipOutcome::Claimed);
                }
                Ok(Ok(false)) => match self.holder(group).await? {
                    Some(holder) if holder == worker_id => {
                        return Ok(LeadershipOutcome::AlreadyLeader);
                    }
                    Some(holder) => {
                        debug!(group, worker_id, holder = %holder, "leadership held by another worker");
                        return Ok(LeadershipOutcome::Conflict { holder });
                    }
                    // Released between our swap and the read; try again.
                    None => continue,
                },
                Ok(Err(StoreError::BudgetExceeded)) => {
                    return Err(CoordinatorError::BudgetExceeded);
                }
                Ok(Err(e)) => {
                    warn!(group, worker_id, attempt, error = %e, "leadership claim failed");
                    last_error = e.into();
                }
                Err(_) => {
                    debug!(group, worker_id, attempt, "leadership claim timed out");
                    last_error = CoordinatorError::Timeout;
                }
            }
        }

        Err(last_error)
    }

    /// Clears `group`'s slot if `worker_id` holds it. Returns true if cleared.
    pub async fn release(&self, group: &str, worker_id: &str) -> Result<bool> {
        let key = keys::leader(group);
        let released = self
            .store
            .compare_and_swap(&key, Some(worker_id.as_bytes()), None)
            .await?;

        if released {
            self.holders.remove_if(group, |_, holder| holder == worker_id);
            info!(group, worker_id, "heartbeat leadership released");
        }
        Ok(released)
    }

    /// Reads the current holder of `group`'s slot from the store.
    pub async fn holder(&self, group: &str) -> Result<Option<WorkerId>> {
        let holder = self
            .store
            .get(&keys::leader(group))
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());

        match &holder {
            Some(id) => {
                self.holders.insert(group.to_owned(), id.clone());
            }
            None => {
                self.holders.remove(group);
            }
        }
        Ok(holder)
    }

    /// Last holder seen by this coordinator, without touching the store.
    pub fn cached_holder(&self, group: &str) -> Option<WorkerId> {
        self.holders.get(group).map(|h| h.value().clone())
    }
}
