pub mod circuit_breaker;
pub mod retry;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redis::AsyncCommands;
use ring::hmac;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dedup::{fingerprint, DedupCache};
use crate::error::{OrchestratorError, Result};
use crate::queue_bus::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::queue_bus::retry::{RetryConfig, RetryHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Critical = 4,
    High = 3,
    Normal = 2,
    Low = 1,
}

impl Priority {
    fn score(self, created_at_ms: i64) -> f64 {
        (self as i32 as f64) * 1e15 + created_at_ms as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub topic: String,
    pub body: serde_json::Value,
    pub priority: Priority,
    pub created_at_ms: i64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default)]
pub struct PublishOutcome {
    pub duplicate: bool,
    pub fallback: bool,
}

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub priority: Priority,
    /// Bypass the batching buffer and publish immediately.
    pub force_direct: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            force_direct: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueBusConfig {
    pub redis_url: String,
    pub queue_prefix: String,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub max_buffer_size: usize,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub dedup_window: chrono::Duration,
    pub dedup_capacity: usize,
}

struct BufferedEntry {
    message: QueuedMessage,
    fingerprint: String,
    responder: oneshot::Sender<Result<PublishOutcome>>,
}

/// At-least-once topical message bus backed by Redis sorted sets (score encodes
/// priority + arrival order, same as the teacher's `events::queue_manager`),
/// wrapped with batching, a bounded overflow-to-dead-letter policy, publish
/// idempotency, and a shared circuit breaker + retry combinator.
pub struct QueueBus {
    config: QueueBusConfig,
    manager: redis::aio::ConnectionManager,
    dedup: DedupCache,
    circuit_breaker: Arc<CircuitBreaker>,
    retry_handler: RetryHandler,
    buffers: Mutex<HashMap<String, VecDeque<BufferedEntry>>>,
    metadata: RwLock<QueueBusMetadata>,
}

#[derive(Debug, Clone)]
pub struct QueueBusMetadata {
    pub instance_id: String,
    pub debug_caller_context: bool,
}

impl QueueBus {
    pub async fn connect(config: QueueBusConfig, instance_id: String) -> Result<Arc<Self>> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let manager = client.get_connection_manager().await?;
        let circuit_breaker = CircuitBreaker::new("queue-bus", config.circuit_breaker.clone());
        let retry_handler = RetryHandler::new(config.retry.clone(), circuit_breaker.clone());
        let dedup = DedupCache::new(config.dedup_capacity, config.dedup_window);

        Ok(Arc::new(Self {
            config,
            manager,
            dedup,
            circuit_breaker,
            retry_handler,
            buffers: Mutex::new(HashMap::new()),
            metadata: RwLock::new(QueueBusMetadata {
                instance_id,
                debug_caller_context: false,
            }),
        }))
    }

    fn pending_key(&self, topic: &str) -> String {
        format!("{}:{}:pending", self.config.queue_prefix, topic)
    }

    fn dead_letter_key(&self, topic: &str) -> String {
        format!("{}:{}:dead_letter", self.config.queue_prefix, topic)
    }

    /// Publish one message. Buffers it unless `opts.force_direct` is set, in
    /// which case it is written to Redis inline and the future resolves only
    /// once the broker acknowledges it.
    pub async fn publish(
        &self,
        topic: &str,
        body: serde_json::Value,
        opts: PublishOptions,
    ) -> Result<PublishOutcome> {
        let fp = compute_fingerprint(topic, &body);
        let message = self.build_message(topic, body, opts.priority).await;

        if opts.force_direct {
            return self.publish_direct(message, &fp).await;
        }

        let (tx, rx) = oneshot::channel();
        self.enqueue_buffered(topic, message, fp, tx).await?;
        rx.await
            .map_err(|_| OrchestratorError::transient("publish responder dropped before flush"))?
    }

    pub async fn batch_publish(
        &self,
        items: Vec<(String, serde_json::Value, Priority)>,
    ) -> Result<Vec<Result<PublishOutcome>>> {
        let mut receivers = Vec::with_capacity(items.len());
        for (topic, body, priority) in items {
            let fp = compute_fingerprint(&topic, &body);
            let message = self.build_message(&topic, body, priority).await;
            let (tx, rx) = oneshot::channel();
            self.enqueue_buffered(&topic, message, fp, tx).await?;
            receivers.push(rx);
        }

        let mut results = Vec::with_capacity(receivers.len());
        for rx in receivers {
            results.push(
                rx.await
                    .unwrap_or_else(|_| Err(OrchestratorError::transient("publish responder dropped"))),
            );
        }
        Ok(results)
    }

    async fn build_message(&self, topic: &str, body: serde_json::Value, priority: Priority) -> QueuedMessage {
        let meta = self.metadata.read().await;
        let mut body = body;
        if let serde_json::Value::Object(ref mut map) = body {
            map.insert("trigger_source".into(), serde_json::json!("queue_bus"));
            map.insert("instance_id_prefix".into(), serde_json::json!(meta.instance_id.chars().take(8).collect::<String>()));
            map.insert("timestamp".into(), serde_json::json!(Utc::now().to_rfc3339()));
        }
        QueuedMessage {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            body,
            priority,
            created_at_ms: Utc::now().timestamp_millis(),
            attempts: 0,
        }
    }

    async fn enqueue_buffered(
        &self,
        topic: &str,
        message: QueuedMessage,
        fp: String,
        responder: oneshot::Sender<Result<PublishOutcome>>,
    ) -> Result<()> {
        let mut buffers = self.buffers.lock().await;
        let buffer = buffers.entry(topic.to_string()).or_default();

        if buffer.len() >= self.config.max_buffer_size {
            let drop_count = (self.config.max_buffer_size / 10).max(1);
            warn!(topic, drop_count, "queue bus buffer full, dropping oldest 10%% to dead letter");
            for _ in 0..drop_count.min(buffer.len()) {
                if let Some(dropped) = buffer.pop_front() {
                    self.push_dead_letter(&dropped.message, "buffer_overflow").await;
                    let _ = dropped.responder.send(Err(OrchestratorError::BufferOverflow { dropped: 1 }));
                }
            }
        }

        buffer.push_back(BufferedEntry { message, fingerprint: fp, responder });
        let should_flush_now = buffer.len() >= self.config.batch_size;
        drop(buffers);

        if should_flush_now {
            self.flush_topic(topic).await;
        }
        Ok(())
    }

    async fn publish_direct(&self, message: QueuedMessage, fp: &str) -> Result<PublishOutcome> {
        let now = Utc::now();
        if self.dedup.check_and_insert(fp, now) {
            return Ok(PublishOutcome { duplicate: true, fallback: false });
        }

        let result = self.write_to_redis(&message).await;
        match result {
            Ok(()) => Ok(PublishOutcome::default()),
            Err(OrchestratorError::CircuitOpen { .. }) => {
                self.dedup.forget(fp);
                Ok(PublishOutcome { duplicate: false, fallback: true })
            }
            Err(e) => {
                self.dedup.forget(fp);
                self.push_dead_letter(&message, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn write_to_redis(&self, message: &QueuedMessage) -> Result<()> {
        let key = self.pending_key(&message.topic);
        let score = message.priority.score(message.created_at_ms);
        let payload = serde_json::to_string(message)?;
        self.retry_handler
            .execute_with_retry(&message.topic, || {
                let mut conn = self.manager.clone();
                let key = key.clone();
                let payload = payload.clone();
                async move {
                    conn.zadd::<_, _, _, ()>(&key, payload, score)
                        .await
                        .map_err(OrchestratorError::from)
                }
            })
            .await
    }

    async fn push_dead_letter(&self, message: &QueuedMessage, reason: &str) {
        let key = self.dead_letter_key(&message.topic);
        let entry = serde_json::json!({
            "message": message,
            "reason": reason,
            "failed_at": Utc::now().to_rfc3339(),
        });
        let mut conn = self.manager.clone();
        if let Ok(payload) = serde_json::to_string(&entry) {
            if let Err(e) = conn.lpush::<_, _, ()>(&key, payload).await {
                warn!(error = %e, "failed to push dead letter entry");
            }
        }
    }

    /// Flush every buffered message for `topic`, resolving each entry's
    /// responder exactly once.
    pub async fn flush_topic(&self, topic: &str) {
        let entries: Vec<BufferedEntry> = {
            let mut buffers = self.buffers.lock().await;
            match buffers.get_mut(topic) {
                Some(buffer) => buffer.drain(..).collect(),
                None => Vec::new(),
            }
        };

        for entry in entries {
            let now = Utc::now();
            if self.dedup.check_and_insert(&entry.fingerprint, now) {
                let _ = entry.responder.send(Ok(PublishOutcome { duplicate: true, fallback: false }));
                continue;
            }

            match self.write_to_redis(&entry.message).await {
                Ok(()) => {
                    let _ = entry.responder.send(Ok(PublishOutcome::default()));
                }
                Err(OrchestratorError::CircuitOpen { .. }) => {
                    self.dedup.forget(&entry.fingerprint);
                    let _ = entry.responder.send(Ok(PublishOutcome { duplicate: false, fallback: true }));
                }
                Err(e) => {
                    self.dedup.forget(&entry.fingerprint);
                    self.push_dead_letter(&entry.message, &e.to_string()).await;
                    let _ = entry.responder.send(Err(e));
                }
            }
        }
    }

    /// Flush every topic with a non-empty buffer. Called by the periodic
    /// flush loop in `run_flush_loop`, and usable directly in tests.
    pub async fn flush_all(&self) {
        let topics: Vec<String> = self.buffers.lock().await.keys().cloned().collect();
        for topic in topics {
            self.flush_topic(&topic).await;
        }
    }

    pub fn spawn_flush_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let interval = this.config.batch_timeout;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.flush_all().await;
            }
        })
    }

    pub async fn queue_depth(&self, topic: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        let key = self.pending_key(topic);
        let depth: u64 = conn.zcard(&key).await?;
        Ok(depth)
    }

    pub async fn dead_letter_len(&self, topic: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        let key = self.dead_letter_key(topic);
        let len: u64 = conn.llen(&key).await?;
        Ok(len)
    }

    pub async fn circuit_state(&self) -> circuit_breaker::CircuitStateKind {
        self.circuit_breaker.state_kind().await
    }

    /// Pop the highest-priority message for `topic`, if any.
    pub async fn pop_next(&self, topic: &str) -> Result<Option<QueuedMessage>> {
        let mut conn = self.manager.clone();
        let key = self.pending_key(topic);
        let popped: Vec<(String, f64)> = conn.zpopmax(&key, 1).await?;
        match popped.into_iter().next() {
            Some((payload, _score)) => {
                let message: QueuedMessage = serde_json::from_str(&payload)?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }
}

/// Verifies an inbound webhook body against a rotating current+next HMAC key
/// pair, so a key rotation doesn't reject a sender still mid-flight with the
/// previous key. Uses `ring::hmac`, the same primitives family the teacher
/// already depends on for content hashing in `utils::security`.
pub fn verify_webhook_signature(
    body: &[u8],
    signature_hex: &str,
    current_key: &str,
    next_key: Option<&str>,
) -> bool {
    let decoded = match hex_decode(signature_hex) {
        Some(bytes) => bytes,
        None => return false,
    };

    let keys = std::iter::once(current_key).chain(next_key.filter(|k| !k.is_empty()));
    for key in keys {
        if key.is_empty() {
            continue;
        }
        let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes());
        if hmac::verify(&hmac_key, body, &decoded).is_ok() {
            return true;
        }
    }
    false
}

pub fn sign_webhook_body(body: &[u8], key: &str) -> String {
    let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes());
    let tag = hmac::sign(&hmac_key, body);
    hex_encode(tag.as_ref())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Fingerprints the caller-supplied `topic`+`body` pair, before `build_message`
/// stamps in a per-call `timestamp`/`trigger_source`/`instance_id_prefix`. Doing
/// this after the stamp would make every resubmission fingerprint differently
/// and defeat `DedupCache` entirely.
fn compute_fingerprint(topic: &str, body: &serde_json::Value) -> String {
    fingerprint(topic, body.to_string().as_bytes())
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
