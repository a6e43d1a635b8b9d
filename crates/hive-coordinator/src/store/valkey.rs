//! Valkey/Redis key-value backend.

use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands};
use deadpool_redis::{Config, Connection, Pool, Runtime};

use super::{KvStore, StoreError};

/// Compare-and-swap where an empty expectation means "key absent" and an
/// empty replacement means "delete".
const CAS_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '0' then
    if current then
        return 0
    end
elseif current ~= ARGV[2] then
    return 0
end
if ARGV[3] == '0' then
    redis.call('DEL', KEYS[1])
else
    redis.call('SET', KEYS[1], ARGV[4])
end
return 1
";

const SCAN_BATCH: usize = 256;

/// Valkey/Redis KV backend.
#[derive(Clone)]
pub struct ValkeyKv {
    pool: Pool,
    namespace: Option<String>,
}

impl ValkeyKv {
    /// Connects and checks the server answers `PING`.
    pub async fn new(
        url: &str,
        namespace: Option<String>,
        pool_size: usize,
    ) -> Result<Self, StoreError> {
        let pool = Config::from_url(url)
            .builder()
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .max_size(pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let kv = Self { pool, namespace };
        let mut conn = kv.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(kv)
    }

    async fn conn(&self) -> Result<Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    fn prefixed_key(&self, key: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:{key}"),
            None => key.to_owned(),
        }
    }

    fn strip_prefix(&self, key: String) -> String {
        match &self.namespace {
            Some(ns) => key
                .strip_prefix(ns.as_str())
                .and_then(|k| k.strip_prefix(':'))
                .map_or_else(|| key.clone(), str::to_owned),
            None => key,
        }
    }
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl KvStore for ValkeyKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn().await?;
        conn.get(self.prefixed_key(key)).await.map_err(backend)
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(self.prefixed_key(key), value)
            .await
            .map_err(backend)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let deleted: i64 = conn.del(self.prefixed_key(key)).await.map_err(backend)?;
        Ok(deleted > 0)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        let pattern = self.prefixed_key(&format!("{prefix}*"));

        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut *conn)
                .await
                .map_err(backend)?;
            keys.extend(batch.into_iter().map(|k| self.strip_prefix(k)));
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;

        let swapped: i64 = redis::Script::new(CAS_SCRIPT)
            .key(self.prefixed_key(key))
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(if new.is_some() { "1" } else { "0" })
            .arg(new.unwrap_or_default())
            .invoke_async(&mut *conn)
            .await
            .map_err(backend)?;

        Ok(swapped == 1)
    }
}
