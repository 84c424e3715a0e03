//! Message-id dedup cache
//!
//! Remembers recently seen MESSAGE ids so a retried message reaches the
//! application at most once within the retention window.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

/// Default retention (10 minutes)
const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Maximum remembered ids
const DEFAULT_MAX_SIZE: usize = 50_000;

/// TTL-bounded set of seen message ids.
///
/// Ids are kept in insertion order, so the least recently used entry is
/// always the oldest sighting and both expiry and capacity eviction pop from
/// that end.
pub struct MessageIdCache {
    entries: LruCache<String, Instant>,
    ttl: Duration,
}

impl MessageIdCache {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_TTL, DEFAULT_MAX_SIZE)
    }

    /// Create a cache with custom TTL and max size
    pub fn with_config(ttl: Duration, max_size: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN)),
            ttl,
        }
    }

    /// Record `id`; returns true if it was not seen within the window
    pub fn check_and_insert(&mut self, id: &str) -> bool {
        self.check_and_insert_at(id, Instant::now())
    }

    pub fn check_and_insert_at(&mut self, id: &str, now: Instant) -> bool {
        // peek keeps a duplicate from refreshing its position
        if let Some(seen) = self.entries.peek(id) {
            if now.saturating_duration_since(*seen) < self.ttl {
                return false;
            }
        }
        self.evict_expired_at(now);
        // at capacity `push` drops the oldest sighting
        self.entries.push(id.to_string(), now);
        true
    }

    /// Whether `id` was seen within the window
    pub fn contains(&self, id: &str) -> bool {
        self.entries
            .peek(id)
            .map(|seen| seen.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Purge ids past the retention window; returns how many were removed
    pub fn evict_expired(&mut self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    fn evict_expired_at(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some((_, seen)) = self.entries.peek_lru() {
            if now.saturating_duration_since(*seen) < self.ttl {
                break;
            }
            self.entries.pop_lru();
            removed += 1;
        }
        removed
    }
}

impl Default for MessageIdCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_rejected() {
        let mut cache = MessageIdCache::new();
        assert!(cache.check_and_insert("m1"));
        assert!(!cache.check_and_insert("m1"));
        assert!(cache.check_and_insert("m2"));
        assert!(cache.contains("m1"));
    }

    #[test]
    fn test_accepted_again_after_window() {
        let mut cache = MessageIdCache::with_config(Duration::from_secs(60), 100);
        let t0 = Instant::now();
        assert!(cache.check_and_insert_at("m1", t0));
        assert!(!cache.check_and_insert_at("m1", t0 + Duration::from_secs(59)));
        assert!(cache.check_and_insert_at("m1", t0 + Duration::from_secs(61)));
    }

    #[test]
    fn test_max_size_eviction() {
        let mut cache = MessageIdCache::with_config(DEFAULT_TTL, 3);
        let t0 = Instant::now();
        cache.check_and_insert_at("a", t0);
        cache.check_and_insert_at("b", t0 + Duration::from_millis(1));
        cache.check_and_insert_at("c", t0 + Duration::from_millis(2));
        cache.check_and_insert_at("d", t0 + Duration::from_millis(3));
        assert_eq!(cache.len(), 3);
        // oldest went first
        assert!(cache.check_and_insert_at("a", t0 + Duration::from_millis(4)));
    }

    #[test]
    fn test_duplicate_does_not_refresh_position() {
        let mut cache = MessageIdCache::with_config(DEFAULT_TTL, 2);
        let t0 = Instant::now();
        cache.check_and_insert_at("a", t0);
        cache.check_and_insert_at("b", t0 + Duration::from_millis(1));
        assert!(!cache.check_and_insert_at("a", t0 + Duration::from_millis(2)));
        cache.check_and_insert_at("c", t0 + Duration::from_millis(3));
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
    }

    #[test]
    fn test_full_cache_insert_stays_cheap() {
        let mut cache = MessageIdCache::with_config(DEFAULT_TTL, 10_000);
        let t0 = Instant::now();
        let started = Instant::now();
        for i in 0..100_000u32 {
            cache.check_and_insert_at(&format!("m{}", i), t0);
        }
        assert_eq!(cache.len(), 10_000);
        assert!(cache.contains("m99999"));
        assert!(!cache.contains("m0"));
        // a linear scan per insert would take far longer
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_evict_expired() {
        let mut cache = MessageIdCache::with_config(Duration::from_millis(10), 100);
        cache.check_and_insert("x");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());
    }
}
