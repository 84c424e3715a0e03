//! # XOR-Metric Routing Table
//!
//! Kademlia-style k-buckets keyed by [`NodeId`].
//!
//! - **Bucket index**: number of leading zero bits in `self ^ other`
//! - **Ordering**: results are sorted by raw XOR distance, never insertion order
//! - **Refresh**: buckets idle for [`BUCKET_STALE_THRESHOLD`] yield random ids
//!   inside their range for a FIND_NODE sweep
//!
//! All lookups are synchronous over the in-memory table.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use mumblechat_core::NodeId;
use parking_lot::RwLock;
use rand::RngCore;

use crate::protocol::PeerRecord;
use crate::ratelimit::PeerRateLimiter;

/// Contacts per bucket
pub const K: usize = 20;

/// Buckets without activity for this long are refreshed
pub const BUCKET_STALE_THRESHOLD: Duration = Duration::from_secs(15 * 60);

const NUM_BUCKETS: usize = 256;

/// Compare two XOR distances as big-endian integers
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> Ordering {
    a.cmp(b)
}

pub fn bucket_index(self_id: &NodeId, other: &NodeId) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    NUM_BUCKETS - 1
}

/// A random id that falls into `bucket_idx` relative to `self_id`
pub fn random_id_for_bucket(self_id: &NodeId, bucket_idx: usize) -> NodeId {
    let bucket_idx = bucket_idx.min(NUM_BUCKETS - 1);
    let mut distance = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut distance);

    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let self_bytes = self_id.as_bytes();
    let mut target = [0u8; 32];
    for i in 0..32 {
        target[i] = self_bytes[i] ^ distance[i];
    }
    NodeId::from_bytes(target)
}

#[derive(Debug, Clone)]
struct Bucket {
    contacts: Vec<PeerRecord>,
    last_refresh: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            contacts: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn is_stale(&self, threshold: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_refresh) > threshold
    }
}

/// Outcome of [`RoutingTable::store_peer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    Refreshed,
    /// Bucket full; existing contacts are kept
    BucketFull,
    /// Our own id
    Ignored,
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        Self {
            self_id,
            k: k.max(1),
            buckets: (0..NUM_BUCKETS).map(|_| Bucket::new()).collect(),
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Insert or refresh a contact. Refreshed contacts move to the tail
    /// (most recently seen) and take the newer address.
    pub fn store_peer(&mut self, record: PeerRecord) -> StoreOutcome {
        if record.node_id == self.self_id {
            return StoreOutcome::Ignored;
        }
        let idx = bucket_index(&self.self_id, &record.node_id);
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.contacts.iter().position(|c| c.node_id == record.node_id) {
            bucket.contacts.remove(pos);
            bucket.contacts.push(record);
            bucket.last_refresh = Instant::now();
            return StoreOutcome::Refreshed;
        }

        if bucket.contacts.len() < self.k {
            bucket.contacts.push(record);
            bucket.last_refresh = Instant::now();
            StoreOutcome::Inserted
        } else {
            StoreOutcome::BucketFull
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> bool {
        let idx = bucket_index(&self.self_id, id);
        let bucket = &mut self.buckets[idx];
        match bucket.contacts.iter().position(|c| &c.node_id == id) {
            Some(pos) => {
                bucket.contacts.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<&PeerRecord> {
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx].contacts.iter().find(|c| &c.node_id == id)
    }

    /// Up to `count` known contacts closest to `target`, nearest first
    pub fn find_node(&self, target: &NodeId, count: usize) -> Vec<PeerRecord> {
        if count == 0 {
            return Vec::new();
        }

        struct Entry<'a> {
            dist: [u8; 32],
            record: &'a PeerRecord,
        }
        impl PartialEq for Entry<'_> {
            fn eq(&self, other: &Self) -> bool {
                self.dist == other.dist
            }
        }
        impl Eq for Entry<'_> {}
        impl Ord for Entry<'_> {
            fn cmp(&self, other: &Self) -> Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }
        impl PartialOrd for Entry<'_> {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        // max-heap of the current best `count`
        let mut heap: BinaryHeap<Entry<'_>> = BinaryHeap::with_capacity(count + 1);
        for bucket in &self.buckets {
            for record in &bucket.contacts {
                let dist = record.node_id.xor_distance(target);
                if heap.len() < count {
                    heap.push(Entry { dist, record });
                } else if let Some(max) = heap.peek() {
                    if distance_cmp(&dist, &max.dist) == Ordering::Less {
                        heap.push(Entry { dist, record });
                        heap.pop();
                    }
                }
            }
        }

        heap.into_sorted_vec()
            .into_iter()
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_peers(&self) -> Vec<PeerRecord> {
        self.buckets
            .iter()
            .flat_map(|b| b.contacts.iter().cloned())
            .collect()
    }

    pub fn stale_bucket_indices(&self, threshold: Duration, now: Instant) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.contacts.is_empty() && b.is_stale(threshold, now))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.last_refresh = Instant::now();
        }
    }
}

/// Routing table plus inbound query limiter, shared across connection tasks
#[derive(Debug)]
pub struct Dht {
    table: RwLock<RoutingTable>,
    limiter: PeerRateLimiter<NodeId>,
}

impl Dht {
    pub fn new(self_id: NodeId) -> Self {
        Self::with_limiter(self_id, PeerRateLimiter::default())
    }

    pub fn with_limiter(self_id: NodeId, limiter: PeerRateLimiter<NodeId>) -> Self {
        Self {
            table: RwLock::new(RoutingTable::new(self_id, K)),
            limiter,
        }
    }

    pub fn store_peer(&self, record: PeerRecord) -> StoreOutcome {
        self.table.write().store_peer(record)
    }

    pub fn remove(&self, id: &NodeId) -> bool {
        self.table.write().remove(id)
    }

    pub fn find_node(&self, target: &NodeId, count: usize) -> Vec<PeerRecord> {
        self.table.read().find_node(target, count)
    }

    /// Charge one request against `from`'s budget
    pub fn allow_request(&self, from: NodeId) -> bool {
        self.limiter.allow(from)
    }

    /// Answer a remote query, or `None` if `from` is over its budget
    pub fn handle_query(&self, from: NodeId, target: &NodeId) -> Option<Vec<PeerRecord>> {
        if !self.allow_request(from) {
            return None;
        }
        let mut peers = self.find_node(target, K + 1);
        peers.retain(|p| p.node_id != from);
        peers.truncate(K);
        Some(peers)
    }

    pub fn forget_peer(&self, id: &NodeId) {
        self.limiter.remove(id);
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_peers(&self) -> Vec<PeerRecord> {
        self.table.read().all_peers()
    }

    /// Random lookup targets for buckets idle past the threshold; marks
    /// those buckets refreshed
    pub fn refresh_targets(&self) -> Vec<NodeId> {
        let mut table = self.table.write();
        let stale = table.stale_bucket_indices(BUCKET_STALE_THRESHOLD, Instant::now());
        let self_id = *table.self_id();
        stale
            .into_iter()
            .map(|idx| {
                table.mark_bucket_refreshed(idx);
                random_id_for_bucket(&self_id, idx)
            })
            .collect()
    }
}
