//! Persistent cache of peers we have reached before.
//!
//! Stored as JSON at `<data>/cache/peers.json`. Most recent successes come
//! first in [`PeerCache::candidates`]. Peers that fail
//! [`MAX_CONSECUTIVE_FAILURES`] times in a row are dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use mumblechat_core::NodeId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::PeerRecord;

pub const MAX_CACHED_PEERS: usize = 500;

pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedPeer {
    pub node_id: NodeId,
    #[serde(default)]
    pub wallet_address: String,
    pub address: String,
    #[serde(default)]
    pub last_success: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub success_count: u32,
}

impl CachedPeer {
    pub fn to_record(&self) -> PeerRecord {
        PeerRecord {
            node_id: self.node_id,
            wallet_address: self.wallet_address.clone(),
            address: self.address.clone(),
            last_seen: self.last_success,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PeerCacheFile {
    #[serde(default)]
    peers: Vec<CachedPeer>,
}

#[derive(Debug)]
pub struct PeerCache {
    path: PathBuf,
    entries: HashMap<NodeId, CachedPeer>,
}

impl PeerCache {
    /// Load from `path`. A missing or unreadable file yields an empty cache.
    pub fn load(path: &Path) -> Self {
        let entries = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<PeerCacheFile>(&content) {
                Ok(file) => file.peers.into_iter().map(|p| (p.node_id, p)).collect(),
                Err(e) => {
                    warn!("Ignoring corrupt peer cache {:?}: {}", path, e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        debug!("Loaded {} cached peers from {:?}", entries.len(), path);
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    pub fn record_success(&mut self, record: &PeerRecord, now_ms: u64) {
        let entry = self
            .entries
            .entry(record.node_id)
            .or_insert_with(|| CachedPeer {
                node_id: record.node_id,
                wallet_address: record.wallet_address.clone(),
                address: record.address.clone(),
                last_success: 0,
                consecutive_failures: 0,
                success_count: 0,
            });
        entry.address = record.address.clone();
        if !record.wallet_address.is_empty() {
            entry.wallet_address = record.wallet_address.clone();
        }
        entry.last_success = now_ms;
        entry.consecutive_failures = 0;
        entry.success_count = entry.success_count.saturating_add(1);

        if self.entries.len() > MAX_CACHED_PEERS {
            self.evict_least_recent();
        }
    }

    /// Returns true if the peer was dropped
    pub fn record_failure(&mut self, node_id: &NodeId) -> bool {
        let Some(entry) = self.entries.get_mut(node_id) else {
            return false;
        };
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            self.entries.remove(node_id);
            debug!("Dropped peer {} after repeated failures", node_id.short());
            return true;
        }
        false
    }

    /// Cached peers, most recent success first
    pub fn candidates(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<&CachedPeer> = self.entries.values().collect();
        peers.sort_by(|a, b| {
            b.last_success
                .cmp(&a.last_success)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        peers.into_iter().map(CachedPeer::to_record).collect()
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&CachedPeer> {
        self.entries.get(node_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write atomically (temp file + rename)
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut peers: Vec<CachedPeer> = self.entries.values().cloned().collect();
        peers.sort_by(|a, b| b.last_success.cmp(&a.last_success));
        let content = serde_json::to_vec_pretty(&PeerCacheFile { peers })?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn evict_least_recent(&mut self) {
        if let Some(oldest) = self
            .entries
            .values()
            .min_by_key(|p| p.last_success)
            .map(|p| p.node_id)
        {
            self.entries.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("mumblechat-peercache-{}-{}", name, std::process::id()))
            .join("cache")
            .join("peers.json")
    }

    fn record(b: u8) -> PeerRecord {
        PeerRecord {
            node_id: NodeId::from_bytes([b; 32]),
            wallet_address: format!("0x{:02x}", b),
            address: format!("10.0.0.{}:19370", b),
            last_seen: 0,
        }
    }

    #[test]
    fn test_recent_successes_first() {
        let mut cache = PeerCache::load(&temp_path("order"));
        cache.record_success(&record(1), 100);
        cache.record_success(&record(2), 300);
        cache.record_success(&record(3), 200);
        let ids: Vec<u8> = cache
            .candidates()
            .iter()
            .map(|p| p.node_id.as_bytes()[0])
            .collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_dropped_after_consecutive_failures() {
        let mut cache = PeerCache::load(&temp_path("failures"));
        let id = record(1).node_id;
        cache.record_success(&record(1), 1);
        for _ in 0..MAX_CONSECUTIVE_FAILURES - 1 {
            assert!(!cache.record_failure(&id));
        }
        assert!(cache.record_failure(&id));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_success_resets_failures() {
        let mut cache = PeerCache::load(&temp_path("reset"));
        let id = record(1).node_id;
        cache.record_success(&record(1), 1);
        for _ in 0..4 {
            cache.record_failure(&id);
        }
        cache.record_success(&record(1), 2);
        assert_eq!(cache.get(&id).unwrap().consecutive_failures, 0);
        assert!(!cache.record_failure(&id));
    }

    #[test]
    fn test_capacity_evicts_least_recent() {
        let mut cache = PeerCache::load(&temp_path("cap"));
        for i in 0..=MAX_CACHED_PEERS {
            let mut bytes = [0u8; 32];
            bytes[..4].copy_from_slice(&(i as u32).to_be_bytes());
            let rec = PeerRecord {
                node_id: NodeId::from_bytes(bytes),
                wallet_address: String::new(),
                address: "1.1.1.1:1".to_string(),
                last_seen: 0,
            };
            cache.record_success(&rec, 1000 + i as u64);
        }
        assert_eq!(cache.len(), MAX_CACHED_PEERS);
        assert!(cache.get(&NodeId::from_bytes([0u8; 32])).is_none());
    }

    #[test]
    fn test_save_and_load() {
        let path = temp_path("persist");
        let mut cache = PeerCache::load(&path);
        cache.record_success(&record(7), 42);
        cache.save().unwrap();

        let reloaded = PeerCache::load(&path);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.candidates()[0].address, "10.0.0.7:19370");

        let _ = std::fs::remove_dir_all(path.parent().unwrap().parent().unwrap());
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let path = temp_path("corrupt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{{{").unwrap();
        assert!(PeerCache::load(&path).is_empty());
        let _ = std::fs::remove_dir_all(path.parent().unwrap().parent().unwrap());
    }
}
