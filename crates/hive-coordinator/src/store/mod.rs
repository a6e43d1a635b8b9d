//! Durable state behind the in-memory registry.
//!
//! Every durable write goes through [`BudgetedStore`], which enforces the
//! backing store's write budget. The raw [`KvStore`] backends only know how to
//! talk to their storage.

mod budget;
mod memory;
mod valkey;

pub use budget::{BudgetUsage, BudgetedStore, Priority, WriteBudget, WriteOutcome};
pub use memory::MemoryKv;
pub use valkey::ValkeyKv;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::config::StoreConfig;

/// Errors from the key-value backends and the budget layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("operation timed out")]
    Timeout,

    #[error("backend error: {0}")]
    Backend(String),

    #[error("write budget exceeded")]
    BudgetExceeded,
}

/// Key-value backend.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Returns every key starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Atomically replaces the value at `key` if it currently equals
    /// `expected` (`None` meaning absent). A `new` of `None` deletes the key.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, StoreError>;
}

/// Key layout. Each worker, service and leader slot is its own key so the
/// budget can prioritise per key.
pub mod keys {
    pub const WORKERS: &str = "workers/";
    pub const SERVICES: &str = "services/";
    pub const LEADER: &str = "leader/";

    pub fn worker(id: &str) -> String {
        format!("{WORKERS}{id}")
    }

    pub fn service(name: &str) -> String {
        format!("{SERVICES}{name}")
    }

    pub fn leader(group: &str) -> String {
        format!("{LEADER}{group}")
    }
}

/// Connects the backend selected in the configuration.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn KvStore>, StoreError> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryKv::new())),
        StoreConfig::Valkey(valkey) => {
            let kv = ValkeyKv::new(&valkey.url, valkey.namespace.clone(), valkey.pool_size).await?;
            Ok(Arc::new(kv))
        }
    }
}
