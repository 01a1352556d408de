//! Event deduplication.
//!
//! A stable fingerprint over `(source, event_type, canonical data)`
//! identifies semantically equivalent events; volatile fields are left
//! out so retransmissions hash identically. The cache is per-instance
//! and best-effort: two workers racing on the same event may both index
//! it, which downstream consumers tolerate.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};

use crate::models::Event;

/// Fields excluded from the fingerprint because they differ between
/// otherwise-identical deliveries.
const VOLATILE_FIELDS: &[&str] = &["timestamp", "id", "request_id", "sequence_num"];

/// Stable content hash for an event.
pub fn fingerprint(event: &Event) -> String {
    let mut canonical: Vec<(&String, &Value)> = event
        .data
        .iter()
        .filter(|(key, _)| !VOLATILE_FIELDS.contains(&key.as_str()))
        .collect();
    canonical.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    hasher.update(event.source.as_bytes());
    hasher.update([0]);
    hasher.update(event.event_type.as_bytes());
    hasher.update([0]);
    for (key, value) in canonical {
        hasher.update(key.as_bytes());
        hasher.update([1]);
        hasher.update(value.to_string().as_bytes());
        hasher.update([1]);
    }
    format!("{:x}", hasher.finalize())
}

/// Memory-bounded recent-fingerprint cache with TTL expiry. Entries are
/// evicted oldest-first once the capacity is reached; fingerprints are
/// inserted once and never refreshed, so insertion order is age order.
pub struct DedupCache {
    window_secs: u64,
    max_entries: usize,
    seen: HashMap<String, u64>,
    order: VecDeque<(String, u64)>,
}

impl DedupCache {
    pub fn new(window_secs: u64, max_entries: usize) -> Self {
        Self {
            window_secs,
            max_entries: max_entries.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record the fingerprint; returns true when it was already present
    /// inside the window (a duplicate).
    pub fn check_and_insert(&mut self, fingerprint: &str, now_secs: u64) -> bool {
        self.expire(now_secs);

        if let Some(inserted_at) = self.seen.get(fingerprint) {
            if now_secs.saturating_sub(*inserted_at) < self.window_secs {
                return true;
            }
        }

        while self.seen.len() >= self.max_entries {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.seen.remove(&oldest);
            } else {
                break;
            }
        }
        self.seen.insert(fingerprint.to_string(), now_secs);
        self.order.push_back((fingerprint.to_string(), now_secs));
        false
    }

    fn expire(&mut self, now_secs: u64) {
        while let Some((key, inserted_at)) = self.order.front() {
            if now_secs.saturating_sub(*inserted_at) >= self.window_secs {
                self.seen.remove(key);
                self.order.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Canonical subset used by tests and debugging tools.
pub fn canonical_data(event: &Event) -> Map<String, Value> {
    event
        .data
        .iter()
        .filter(|(key, _)| !VOLATILE_FIELDS.contains(&key.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(data: Value) -> Event {
        serde_json::from_value(json!({
            "source": "fw",
            "event_type": "network",
            "timestamp": "2024-02-05T14:11:05Z",
            "data": data,
        }))
        .unwrap()
    }

    #[test]
    fn volatile_fields_do_not_change_fingerprint() {
        let a = event(json!({"src_ip": "1.2.3.4", "request_id": "aaa", "timestamp": "x"}));
        let b = event(json!({"src_ip": "1.2.3.4", "request_id": "bbb", "timestamp": "y"}));
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn content_changes_fingerprint() {
        let a = event(json!({"src_ip": "1.2.3.4"}));
        let b = event(json!({"src_ip": "5.6.7.8"}));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn key_order_is_canonical() {
        let a = event(json!({"a": 1, "b": 2}));
        let b = event(json!({"b": 2, "a": 1}));
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn duplicate_within_window_detected() {
        let mut cache = DedupCache::new(300, 1000);
        assert!(!cache.check_and_insert("fp1", 100));
        assert!(cache.check_and_insert("fp1", 200));
        // Window expired: counts as new again.
        assert!(!cache.check_and_insert("fp1", 500));
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let mut cache = DedupCache::new(3600, 2);
        cache.check_and_insert("a", 1);
        cache.check_and_insert("b", 2);
        cache.check_and_insert("c", 3);
        assert_eq!(cache.len(), 2);
        // "a" was evicted, so it reads as fresh.
        assert!(!cache.check_and_insert("a", 4));
        // "c" is still cached.
        assert!(cache.check_and_insert("c", 5));
    }
}
