//! Per-peer token buckets for DHT queries.
//!
//! FIND_NODE and PEER_EXCHANGE requests above the budget are dropped, not
//! queued. Tracked peers are bounded by an LRU.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

/// Requests allowed per peer per window
pub const DEFAULT_REQUESTS_PER_WINDOW: usize = 20;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

pub const MAX_TRACKED_PEERS: usize = 1000;

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: usize, now: Instant) -> Self {
        Self {
            tokens: capacity as f64,
            last_update: now,
        }
    }

    fn try_consume(&mut self, rate: f64, capacity: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();

        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token-bucket limiter keyed by peer
#[derive(Debug)]
pub struct PeerRateLimiter<K: Hash + Eq> {
    capacity: usize,
    rate_per_sec: f64,
    buckets: Mutex<LruCache<K, TokenBucket>>,
}

impl<K: Hash + Eq> PeerRateLimiter<K> {
    pub fn new(capacity: usize, window: Duration, max_tracked: usize) -> Self {
        let window_secs = window.as_secs_f64().max(f64::EPSILON);
        Self {
            capacity,
            rate_per_sec: capacity as f64 / window_secs,
            buckets: Mutex::new(LruCache::new(
                NonZeroUsize::new(max_tracked).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// Consume one token for `peer`
    pub fn allow(&self, peer: K) -> bool {
        self.allow_at(peer, Instant::now())
    }

    pub fn allow_at(&self, peer: K, now: Instant) -> bool {
        let capacity = self.capacity;
        let mut buckets = self.buckets.lock();
        let bucket = buckets.get_or_insert_mut(peer, || TokenBucket::new(capacity, now));
        bucket.try_consume(self.rate_per_sec, capacity as f64, now)
    }

    /// Forget a peer (e.g. on disconnect)
    pub fn remove(&self, peer: &K) {
        self.buckets.lock().pop(peer);
    }

    pub fn tracked(&self) -> usize {
        self.buckets.lock().len()
    }
}

impl<K: Hash + Eq> Default for PeerRateLimiter<K> {
    fn default() -> Self {
        Self::new(DEFAULT_REQUESTS_PER_WINDOW, DEFAULT_WINDOW, MAX_TRACKED_PEERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_per_peer() {
        let limiter: PeerRateLimiter<u32> = PeerRateLimiter::new(5, Duration::from_secs(60), 10);
        let now = Instant::now();

        for _ in 0..5 {
            assert!(limiter.allow_at(1, now));
        }
        assert!(!limiter.allow_at(1, now));

        // other peers unaffected
        assert!(limiter.allow_at(2, now));
    }

    #[test]
    fn test_refill_over_time() {
        let limiter: PeerRateLimiter<u32> = PeerRateLimiter::new(2, Duration::from_secs(2), 10);
        let now = Instant::now();
        assert!(limiter.allow_at(1, now));
        assert!(limiter.allow_at(1, now));
        assert!(!limiter.allow_at(1, now));

        // 1 token per second
        assert!(limiter.allow_at(1, now + Duration::from_millis(1100)));
    }

    #[test]
    fn test_lru_bounds_tracked_peers() {
        let limiter: PeerRateLimiter<u32> = PeerRateLimiter::new(1, Duration::from_secs(60), 3);
        let now = Instant::now();
        for peer in 0..10 {
            limiter.allow_at(peer, now);
        }
        assert_eq!(limiter.tracked(), 3);

        // evicted peer starts fresh
        assert!(limiter.allow_at(0, now));
    }

    #[test]
    fn test_remove_resets_budget() {
        let limiter: PeerRateLimiter<u32> = PeerRateLimiter::new(1, Duration::from_secs(60), 3);
        let now = Instant::now();
        assert!(limiter.allow_at(7, now));
        assert!(!limiter.allow_at(7, now));
        limiter.remove(&7);
        assert!(limiter.allow_at(7, now));
    }
}
