//! MumbleChat Registry
//!
//! Client for the on-chain relay registry and the staking token it checks.
//!
//! ## Registration Flow
//!
//! 1. **Approve**: the node wallet approves the registry to pull the tier's
//!    minimum stake from the token contract.
//! 2. **Register**: `registerNodeWithId` records the node id, machine hash,
//!    storage allocation and public endpoint. The contract derives the tier
//!    from the storage allocation.
//! 3. **Discover**: other nodes read `getActiveEndpoints()` to bootstrap.
//!    Registration is eventually consistent; a fresh node may not be listed
//!    immediately.

pub mod abi;
mod client;
mod resolver;
mod types;

pub use client::{RegistryClient, RegistryConfig, RegistryMode};
pub use resolver::RegistryResolver;
pub use types::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("RPC error: {0}")]
    RpcError(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Insufficient stake: {required} required, {approved} approved")]
    InsufficientStake { required: u128, approved: u128 },

    #[error("Insufficient storage: {0} MB does not qualify for any tier")]
    InsufficientStorage(u64),

    #[error("Node already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("ABI error: {0}")]
    Abi(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RegistryError {
    /// Failures the operator can fix by staking or allocating more
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            RegistryError::InsufficientStake { .. } | RegistryError::InsufficientStorage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actionable_errors() {
        assert!(RegistryError::InsufficientStake { required: 1, approved: 0 }.is_actionable());
        assert!(RegistryError::InsufficientStorage(10).is_actionable());
        assert!(!RegistryError::RpcError("down".to_string()).is_actionable());
        assert!(!RegistryError::AlreadyRegistered("x".to_string()).is_actionable());
    }
}
