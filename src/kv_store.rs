use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

/// Eventually-consistent key/value store with TTL, used for the instance
/// registry, distributed locks, and process-crossing idempotency markers.
///
/// Lock semantics are intentionally narrow: `compare_and_swap` only succeeds when
/// the stored value equals `expected` (or the key is absent and `expected` is
/// `None`), mirroring the atomic Lua-script pattern the Redis-backed rate limiter
/// in the teacher repo uses to avoid read-then-write races.
#[async_trait]
pub trait KVStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Atomically set `key` to `new_value` with `ttl_secs` iff the current value
    /// equals `expected` (`None` meaning "absent"). Returns whether the swap took
    /// effect.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
        ttl_secs: u64,
    ) -> Result<bool>;

    /// Delete `key` iff its current value equals `expected`. Used to release a
    /// lock only if this instance still owns it.
    async fn delete_if_matches(&self, key: &str, expected: &str) -> Result<bool>;
}

/// Lua script backing [`RedisKVStore::compare_and_swap`]: read, compare, and
/// conditionally write happen as one atomic server-side operation, so two
/// instances racing to acquire the same lock cannot both observe "absent" and
/// both write.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if (current == false and ARGV[1] == '') or (current == ARGV[1]) then
    redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
    return 1
else
    return 0
end
"#;

const DELETE_IF_MATCHES_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
else
    return 0
end
"#;

pub struct RedisKVStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisKVStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl KVStore for RedisKVStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut conn = self.manager.clone();
        let pattern = format!("{prefix}*");
        let keys: Vec<String> = conn.keys(&pattern).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = conn.get::<_, Option<String>>(&key).await? {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
        ttl_secs: u64,
    ) -> Result<bool> {
        let mut conn = self.manager.clone();
        let script = redis::Script::new(CAS_SCRIPT);
        let result: i32 = script
            .key(key)
            .arg(expected.unwrap_or(""))
            .arg(new_value)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }

    async fn delete_if_matches(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let script = redis::Script::new(DELETE_IF_MATCHES_SCRIPT);
        let result: i32 = script.key(key).arg(expected).invoke_async(&mut conn).await?;
        Ok(result == 1)
    }
}

/// In-memory stand-in for tests: single-process, so `compare_and_swap` uses a
/// plain mutex rather than a Lua script, but preserves the same atomicity
/// contract observed from outside.
#[derive(Default)]
pub struct MemoryKVStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKVStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KVStore for MemoryKVStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set_ex(&self, key: &str, value: &str, _ttl_secs: u64) -> Result<()> {
        self.entries.lock().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
        _ttl_secs: u64,
    ) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let current = entries.get(key).map(|s| s.as_str());
        if current == expected {
            entries.insert(key.to_string(), new_value.to_string());
            debug!(key, "memory kv store compare_and_swap succeeded");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn delete_if_matches(&self, key: &str, expected: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).map(|s| s.as_str()) == Some(expected) {
            entries.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

pub type SharedKVStore = Arc<dyn KVStore>;

pub fn map_redis_err(e: redis::RedisError) -> OrchestratorError {
    OrchestratorError::KvStore(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_kv_cas_only_succeeds_when_expected_matches() {
        let store = MemoryKVStore::new();
        assert!(store.compare_and_swap("lock:a", None, "inst-1", 30).await.unwrap());
        assert!(!store.compare_and_swap("lock:a", None, "inst-2", 30).await.unwrap());
        assert!(store
            .compare_and_swap("lock:a", Some("inst-1"), "inst-2", 30)
            .await
            .unwrap());
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("inst-2"));
    }

    #[tokio::test]
    async fn test_memory_kv_delete_if_matches() {
        let store = MemoryKVStore::new();
        store.set_ex("lock:a", "inst-1", 30).await.unwrap();
        assert!(!store.delete_if_matches("lock:a", "inst-2").await.unwrap());
        assert!(store.delete_if_matches("lock:a", "inst-1").await.unwrap());
        assert!(store.get("lock:a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_kv_scan_prefix() {
        let store = MemoryKVStore::new();
        store.set_ex("instance:a", "{}", 30).await.unwrap();
        store.set_ex("instance:b", "{}", 30).await.unwrap();
        store.set_ex("lock:c", "{}", 30).await.unwrap();
        let found = store.scan_prefix("instance:").await.unwrap();
        assert_eq!(found.len(), 2);
    }
}
