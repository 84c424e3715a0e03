//! Bootstrap candidate selection
//!
//! Merges, in priority order:
//! 1. the peer cache (most recent successes first)
//! 2. active endpoints from an [`EndpointSource`] (the on-chain registry)
//! 3. static seed addresses
//!
//! Candidates are de-duplicated by NodeId, and by address when the id is
//! unknown (seeds). `bootstrap()` never fails: with nothing else available
//! the seeds are still returned.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use mumblechat_core::NodeId;
use parking_lot::Mutex;
use tracing::debug;

use crate::peer_cache::PeerCache;
use crate::protocol::PeerRecord;

/// A source of currently-active peer endpoints
#[async_trait]
pub trait EndpointSource: Send + Sync {
    /// Active endpoints; implementations log and return empty on failure
    async fn active_endpoints(&self) -> Vec<PeerRecord>;
}

/// Where a candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    Cache,
    Registry,
    Seed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapCandidate {
    /// Unknown for static seeds until the handshake completes
    pub node_id: Option<NodeId>,
    pub address: String,
    pub source: CandidateSource,
}

pub struct BootstrapManager {
    local_id: NodeId,
    cache: Arc<Mutex<PeerCache>>,
    resolver: Option<Arc<dyn EndpointSource>>,
    seeds: Vec<String>,
}

impl BootstrapManager {
    pub fn new(
        local_id: NodeId,
        cache: Arc<Mutex<PeerCache>>,
        resolver: Option<Arc<dyn EndpointSource>>,
        seeds: Vec<String>,
    ) -> Self {
        Self {
            local_id,
            cache,
            resolver,
            seeds,
        }
    }

    /// Ordered, de-duplicated candidate list
    pub async fn bootstrap(&self) -> Vec<BootstrapCandidate> {
        let cached = self.cache.lock().candidates();
        let registry = match &self.resolver {
            Some(r) => r.active_endpoints().await,
            None => Vec::new(),
        };

        let mut seen_ids: HashSet<NodeId> = HashSet::new();
        let mut seen_addrs: HashSet<String> = HashSet::new();
        let mut out = Vec::new();

        let tagged = cached
            .into_iter()
            .map(|p| (p, CandidateSource::Cache))
            .chain(registry.into_iter().map(|p| (p, CandidateSource::Registry)));

        for (peer, source) in tagged {
            if peer.node_id == self.local_id || peer.address.is_empty() {
                continue;
            }
            if !seen_ids.insert(peer.node_id) {
                continue;
            }
            seen_addrs.insert(peer.address.clone());
            out.push(BootstrapCandidate {
                node_id: Some(peer.node_id),
                address: peer.address,
                source,
            });
        }

        for seed in &self.seeds {
            if seen_addrs.insert(seed.clone()) {
                out.push(BootstrapCandidate {
                    node_id: None,
                    address: seed.clone(),
                    source: CandidateSource::Seed,
                });
            }
        }

        debug!("Bootstrap produced {} candidates", out.len());
        out
    }
}
