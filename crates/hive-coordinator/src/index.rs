//! Service discovery index: service name → ids of workers providing it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};

use crate::registry::WorkerId;

/// Reverse index from service name to worker ids.
///
/// Both mutations are idempotent. Removing the last id of a service deletes
/// the service key, so the index never holds empty buckets.
#[derive(Debug, Default)]
pub struct ServiceIndex {
    entries: DashMap<String, HashSet<WorkerId>>,
}

impl ServiceIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `worker_id` to `service`. Returns true if it was not present.
    pub fn add(&self, service: &str, worker_id: &str) -> bool {
        self.entries
            .entry(service.to_owned())
            .or_default()
            .insert(worker_id.to_owned())
    }

    /// Removes `worker_id` from `service`. Returns true if it was present.
    pub fn remove(&self, service: &str, worker_id: &str) -> bool {
        match self.entries.entry(service.to_owned()) {
            Entry::Occupied(mut entry) => {
                let removed = entry.get_mut().remove(worker_id);
                if entry.get().is_empty() {
                    entry.remove();
                }
                removed
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Returns true if `worker_id` is listed under `service`.
    pub fn contains(&self, service: &str, worker_id: &str) -> bool {
        self.entries
            .get(service)
            .is_some_and(|ids| ids.contains(worker_id))
    }

    /// Worker ids for `service`, sorted. Unfiltered: callers on the routing
    /// path go through the sweeper instead.
    pub fn list(&self, service: &str) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self
            .entries
            .get(service)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Service names with at least one worker, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Sorted copy of the whole index.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<WorkerId>> {
        self.entries
            .iter()
            .map(|e| {
                let mut ids: Vec<WorkerId> = e.value().iter().cloned().collect();
                ids.sort();
                (e.key().clone(), ids)
            })
            .collect()
    }

    /// Number of services.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
