//! Bootstrap endpoints from the registry, cached for a TTL

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mumblechat_network::{EndpointSource, PeerRecord};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::RegistryClient;

pub struct RegistryResolver {
    client: Arc<RegistryClient>,
    ttl: Duration,
    cache: Mutex<Option<(Instant, Vec<PeerRecord>)>>,
}

impl RegistryResolver {
    pub fn new(client: Arc<RegistryClient>, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            cache: Mutex::new(None),
        }
    }
}

/// Registry endpoints may carry a scheme; peers dial plain `host:port`
fn dial_address(endpoint: &str) -> &str {
    endpoint
        .strip_prefix("tcp://")
        .unwrap_or(endpoint)
        .trim_end_matches('/')
}

#[async_trait]
impl EndpointSource for RegistryResolver {
    async fn active_endpoints(&self) -> Vec<PeerRecord> {
        let mut cache = self.cache.lock().await;
        if let Some((fetched_at, peers)) = cache.as_ref() {
            if fetched_at.elapsed() < self.ttl {
                return peers.clone();
            }
        }

        match self.client.get_active_endpoints().await {
            Ok(rows) => {
                let peers: Vec<PeerRecord> = rows
                    .into_iter()
                    .filter(|r| !r.endpoint.is_empty())
                    .map(|r| PeerRecord {
                        node_id: r.node_id,
                        wallet_address: r.wallet,
                        address: dial_address(&r.endpoint).to_string(),
                        last_seen: 0,
                    })
                    .collect();
                debug!("Registry lists {} active endpoints", peers.len());
                *cache = Some((Instant::now(), peers.clone()));
                peers
            }
            Err(e) => {
                // a stale list beats none
                warn!("Registry lookup failed: {}", e);
                cache.as_ref().map(|(_, p)| p.clone()).unwrap_or_default()
            }
        }
    }
}
