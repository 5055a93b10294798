use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::kv_store::SharedKVStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub url: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    instance_id: String,
    acquired_at: DateTime<Utc>,
    ttl_secs: u64,
    version: i64,
}

/// Registers this replica, maintains its heartbeat, derives leadership, and
/// issues advisory distributed locks, all via [`crate::kv_store::KVStore`].
/// Grounded in the teacher's `telegram::rate_limiter::RedisRateLimitBackend`
/// atomic-script pattern (for lock CAS) and the health-record shape of
/// `tier_orchestrator::core::TierHealth` (for the instance record fields).
pub struct InstanceCoordinator {
    kv: SharedKVStore,
    instance_id: String,
    url: String,
    heartbeat_interval: chrono::Duration,
    instance_timeout: chrono::Duration,
}

const INSTANCE_PREFIX: &str = "instance:";
const LOCK_PREFIX: &str = "lock:";

impl InstanceCoordinator {
    pub fn new(
        kv: SharedKVStore,
        url: impl Into<String>,
        heartbeat_interval: chrono::Duration,
        instance_timeout: chrono::Duration,
    ) -> Self {
        Self {
            kv,
            instance_id: Uuid::new_v4().to_string(),
            url: url.into(),
            heartbeat_interval,
            instance_timeout,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Register this instance and start it sending heartbeats. Returns the
    /// background task handle so callers can await it on shutdown.
    pub async fn start(self: &Arc<Self>) -> Result<tokio::task::JoinHandle<()>> {
        self.register().await?;
        let this = Arc::clone(self);
        let interval = std::time::Duration::from_secs(self.heartbeat_interval.num_seconds().max(1) as u64);
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = this.heartbeat().await {
                    warn!(error = %e, "heartbeat failed");
                }
            }
        }))
    }

    async fn register(&self) -> Result<()> {
        let record = InstanceRecord {
            id: self.instance_id.clone(),
            url: self.url.clone(),
            started_at: Utc::now(),
            last_heartbeat: Utc::now(),
        };
        let key = format!("{INSTANCE_PREFIX}{}", self.instance_id);
        let payload = serde_json::to_string(&record)?;
        self.kv
            .set_ex(&key, &payload, self.instance_timeout.num_seconds().max(1) as u64)
            .await?;
        info!(instance_id = %self.instance_id, "instance registered");
        Ok(())
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.register().await
    }

    pub async fn active_instances(&self) -> Result<Vec<InstanceRecord>> {
        let entries = self.kv.scan_prefix(INSTANCE_PREFIX).await?;
        let now = Utc::now();
        let mut instances = Vec::new();
        for (_key, value) in entries {
            if let Ok(record) = serde_json::from_str::<InstanceRecord>(&value) {
                if now - record.last_heartbeat < self.instance_timeout {
                    instances.push(record);
                }
            }
        }
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }

    /// The active instance whose id sorts lexicographically smallest.
    /// Leadership may change between calls; callers re-check immediately
    /// before any privileged action.
    pub async fn leader(&self) -> Result<Option<InstanceRecord>> {
        Ok(self.active_instances().await?.into_iter().next())
    }

    pub async fn is_leader(&self) -> Result<bool> {
        Ok(self
            .leader()
            .await?
            .map(|l| l.id == self.instance_id)
            .unwrap_or(false))
    }

    /// Remove `instance:*` entries whose heartbeat has gone stale, a defense
    /// in depth against KV TTL lag. Intended to be run only by the leader.
    pub async fn sweep_expired_instances(&self) -> Result<usize> {
        let entries = self.kv.scan_prefix(INSTANCE_PREFIX).await?;
        let now = Utc::now();
        let mut removed = 0;
        for (key, value) in entries {
            if let Ok(record) = serde_json::from_str::<InstanceRecord>(&value) {
                if now - record.last_heartbeat >= self.instance_timeout {
                    self.kv.delete(&key).await?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(removed, "swept expired instance records");
        }
        Ok(removed)
    }

    /// Acquire `name` for `ttl`. Succeeds if the lock is absent, expired-out of
    /// the store, or already owned by this instance; this is advisory — it
    /// only protects callers who check the return value.
    pub async fn acquire_lock(&self, name: &str, ttl: chrono::Duration) -> Result<bool> {
        let key = format!("{LOCK_PREFIX}{name}");
        let current = self.kv.get(&key).await?;
        let current_record: Option<LockRecord> = current.as_deref().and_then(|v| serde_json::from_str(v).ok());

        let expected_str = current.clone();
        let owns_or_absent = match &current_record {
            None => true,
            Some(record) => record.instance_id == self.instance_id,
        };

        if !owns_or_absent {
            return Ok(false);
        }

        let new_record = LockRecord {
            instance_id: self.instance_id.clone(),
            acquired_at: Utc::now(),
            ttl_secs: ttl.num_seconds().max(1) as u64,
            version: Utc::now().timestamp_millis(),
        };
        let new_payload = serde_json::to_string(&new_record)?;

        let acquired = self
            .kv
            .compare_and_swap(&key, expected_str.as_deref(), &new_payload, new_record.ttl_secs)
            .await?;

        if acquired {
            debug!(lock = name, instance_id = %self.instance_id, "lock acquired");
        }
        Ok(acquired)
    }

    pub async fn release_lock(&self, name: &str) -> Result<bool> {
        let key = format!("{LOCK_PREFIX}{name}");
        let current = self.kv.get(&key).await?;
        let Some(current) = current else { return Ok(false) };
        let Ok(record) = serde_json::from_str::<LockRecord>(&current) else {
            return Ok(false);
        };
        if record.instance_id != self.instance_id {
            return Ok(false);
        }
        self.kv.delete_if_matches(&key, &current).await
    }
}
