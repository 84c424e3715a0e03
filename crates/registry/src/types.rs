//! Registry records as seen by the node

use mumblechat_core::{NodeId, Tier};

/// Transaction hash (`0x` hex)
pub type TxHash = String;

/// Registration submitted for a relay node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterNode {
    pub node_id: NodeId,
    /// SHA-256 of the machine id; ties co-located nodes to one machine
    pub machine_id_hash: [u8; 32],
    pub storage_mb: u64,
    /// Public `host:port` other peers dial
    pub endpoint: String,
}

/// On-chain node record (`nodes(bytes32)`)
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub owner: String,
    pub machine_id_hash: [u8; 32],
    pub storage_mb: u64,
    pub tier: Option<Tier>,
    pub endpoint: String,
    pub is_active: bool,
    pub registered_at: u64,
    pub last_activity_at: u64,
    pub pending_rewards: u128,
}

/// One row of `getActiveEndpoints()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveEndpoint {
    pub node_id: NodeId,
    pub endpoint: String,
    pub wallet: String,
    pub tier: Option<Tier>,
}
