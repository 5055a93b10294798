use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Content fingerprint used both by the process-local duplicate-event
/// suppression and by [`crate::queue_bus::QueueBus`]'s publish idempotency
/// cache. Mirrors the teacher's `message_deduplication` approach of hashing
/// normalized content rather than comparing raw bytes.
pub fn fingerprint(topic: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(topic.as_bytes());
    hasher.update(b"\0");
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

struct Entry {
    key: String,
    seen_at: DateTime<Utc>,
}

/// Bounded, TTL-aware LRU of recently seen fingerprints. An empty or unknown
/// fingerprint is always treated as fresh — never suppressed — per
/// SPEC_FULL.md §4.9.
pub struct DedupCache {
    capacity: usize,
    ttl: chrono::Duration,
    entries: Mutex<VecDeque<Entry>>,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: chrono::Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Returns `true` if `key` was already seen within the TTL window (and thus
    /// should be treated as a duplicate); otherwise records it as seen and
    /// returns `false`.
    pub fn check_and_insert(&self, key: &str, now: DateTime<Utc>) -> bool {
        if key.is_empty() {
            return false;
        }

        let mut entries = self.entries.lock().expect("dedup cache mutex poisoned");

        while let Some(front) = entries.front() {
            if now - front.seen_at > self.ttl {
                entries.pop_front();
            } else {
                break;
            }
        }

        if entries.iter().any(|e| e.key == key) {
            return true;
        }

        if entries.len() >= self.capacity {
            entries.pop_front();
        }

        entries.push_back(Entry {
            key: key.to_string(),
            seen_at: now,
        });
        false
    }

    /// Drop a fingerprint early, e.g. after a publish attempt fails, so a retry
    /// of the same logical message isn't mistaken for a duplicate.
    pub fn forget(&self, key: &str) {
        let mut entries = self.entries.lock().expect("dedup cache mutex poisoned");
        entries.retain(|e| e.key != key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("dedup cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_for_same_input() {
        let a = fingerprint("download", b"{\"task\":1}");
        let b = fingerprint("download", b"{\"task\":1}");
        assert_eq!(a, b);
        let c = fingerprint("upload", b"{\"task\":1}");
        assert_ne!(a, c);
    }

    #[test]
    fn test_dedup_cache_flags_repeat_within_ttl() {
        let cache = DedupCache::new(10, chrono::Duration::seconds(60));
        let now = Utc::now();
        assert!(!cache.check_and_insert("abc", now));
        assert!(cache.check_and_insert("abc", now));
    }

    #[test]
    fn test_dedup_cache_expires_ttl() {
        let cache = DedupCache::new(10, chrono::Duration::seconds(5));
        let now = Utc::now();
        assert!(!cache.check_and_insert("abc", now));
        let later = now + chrono::Duration::seconds(10);
        assert!(!cache.check_and_insert("abc", later));
    }

    #[test]
    fn test_dedup_cache_never_suppresses_empty_key() {
        let cache = DedupCache::new(10, chrono::Duration::seconds(60));
        let now = Utc::now();
        assert!(!cache.check_and_insert("", now));
        assert!(!cache.check_and_insert("", now));
    }

    #[test]
    fn test_dedup_cache_evicts_oldest_at_capacity() {
        let cache = DedupCache::new(2, chrono::Duration::seconds(600));
        let now = Utc::now();
        cache.check_and_insert("a", now);
        cache.check_and_insert("b", now);
        cache.check_and_insert("c", now);
        assert_eq!(cache.len(), 2);
        assert!(!cache.check_and_insert("a", now));
    }

    #[test]
    fn test_forget_allows_immediate_retry() {
        let cache = DedupCache::new(10, chrono::Duration::seconds(60));
        let now = Utc::now();
        assert!(!cache.check_and_insert("abc", now));
        cache.forget("abc");
        assert!(!cache.check_and_insert("abc", now));
    }
}
