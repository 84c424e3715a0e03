//! Relay instance records for multi-node machines

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{NodeId, Tier};

/// Runtime status of a co-located relay instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Configured but not running
    #[default]
    Stopped,
    /// Process alive (PID file present and process reachable)
    Running,
    /// Last run exited with an error
    Error,
}

/// One relay identity hosted on this machine.
///
/// Port triple is `(p2p_port, p2p_port + 1, p2p_port + 10)`, allocated from a
/// 100-wide range that no other instance on the machine touches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInstance {
    pub node_id: NodeId,
    pub wallet_address: String,
    pub tier: Tier,
    pub storage_mb: u64,
    pub p2p_port: u16,
    pub ws_port: u16,
    pub api_port: u16,
    pub data_path: PathBuf,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub registered: bool,
    pub created_at: u64,
}

impl NodeInstance {
    pub fn ports(&self) -> [u16; 3] {
        [self.p2p_port, self.ws_port, self.api_port]
    }

    /// Whether any port of `self` collides with any of `ports`
    pub fn overlaps(&self, ports: &[u16]) -> bool {
        self.ports().iter().any(|p| ports.contains(p))
    }
}

/// Aggregated storage view of this machine; recomputed on demand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStorageInfo {
    pub machine_id: String,
    pub disk_total_mb: u64,
    pub disk_free_mb: u64,
    pub safety_buffer_mb: u64,
    pub allocated_mb: u64,
    pub used_mb: u64,
    pub node_count: usize,
    pub available_for_new_nodes_mb: u64,
    pub recommended_tier: Option<Tier>,
}
