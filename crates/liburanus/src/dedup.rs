use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

pub const DEFAULT_DEDUP_CAPACITY: usize = 100;
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Recently published output batches, keyed by digest.
///
/// The cache only records; callers publish every batch regardless of what
/// it reports, since two real batches can carry identical bytes. Entries older than the window are evicted first; if the cache is still
/// above capacity the oldest entries go until it is at half capacity.
#[derive(Debug)]
pub struct DedupCache {
    entries: HashMap<String, Instant>,
    max_entries: usize,
    window: Duration,
}

impl DedupCache {
    pub fn new(max_entries: usize, window: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries: max_entries.max(1),
            window,
        }
    }

    /// Digest identifying one output batch.
    pub fn key(session_id: &str, timestamp_ms: i64, data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(session_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(timestamp_ms.to_be_bytes());
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Record `key`. Returns true if it was already seen inside the window.
    pub fn record(&mut self, key: String, now: Instant) -> bool {
        let repeated = self
            .entries
            .insert(key, now)
            .is_some_and(|seen| now.saturating_duration_since(seen) < self.window);
        if self.entries.len() > self.max_entries {
            self.evict(now);
        }
        repeated
    }

    pub fn evict(&mut self, now: Instant) {
        let window = self.window;
        self.entries
            .retain(|_, seen| now.saturating_duration_since(*seen) < window);

        if self.entries.len() > self.max_entries {
            let mut by_age: Vec<(Instant, String)> = self
                .entries
                .iter()
                .map(|(key, seen)| (*seen, key.clone()))
                .collect();
            by_age.sort();
            let excess = self.entries.len() - self.max_entries / 2;
            for (_, key) in by_age.into_iter().take(excess) {
                self.entries.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_inside_window_is_reported() {
        let mut cache = DedupCache::default();
        let now = Instant::now();
        let key = DedupCache::key("t1", 42, b"hello");
        assert!(!cache.record(key.clone(), now));
        assert!(cache.record(key.clone(), now + Duration::from_secs(1)));
        assert!(!cache.record(key, now + Duration::from_secs(7)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn keys_distinguish_sessions_and_payloads() {
        assert_ne!(DedupCache::key("a", 1, b"x"), DedupCache::key("b", 1, b"x"));
        assert_ne!(DedupCache::key("a", 1, b"x"), DedupCache::key("a", 1, b"y"));
        assert_ne!(DedupCache::key("a", 1, b"x"), DedupCache::key("a", 2, b"x"));
        assert_eq!(DedupCache::key("a", 1, b"x").len(), 64);
    }

    #[test]
    fn size_never_exceeds_cap() {
        let mut cache = DedupCache::new(10, Duration::from_secs(60));
        let start = Instant::now();
        for i in 0..250u64 {
            let now = start + Duration::from_millis(i);
            cache.record(format!("k{i}"), now);
            assert!(cache.len() <= cache.capacity(), "len {} at {i}", cache.len());
        }
    }

    #[test]
    fn overflow_truncates_oldest_to_half() {
        let mut cache = DedupCache::new(10, Duration::from_secs(60));
        let start = Instant::now();
        for i in 0..11u64 {
            cache.record(format!("k{i}"), start + Duration::from_millis(i));
        }
        assert_eq!(cache.len(), 5);
        // The newest survives, the oldest is gone.
        assert!(cache.record("k10".to_string(), start + Duration::from_millis(20)));
        assert!(!cache.record("k0".to_string(), start + Duration::from_millis(20)));
    }

    #[test]
    fn evict_drops_expired_entries() {
        let mut cache = DedupCache::new(10, Duration::from_secs(5));
        let start = Instant::now();
        cache.record("old".to_string(), start);
        cache.record("new".to_string(), start + Duration::from_secs(4));
        cache.evict(start + Duration::from_secs(6));
        assert_eq!(cache.len(), 1);
    }
}
