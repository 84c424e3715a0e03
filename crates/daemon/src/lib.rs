//! MumbleChat Daemon
//!
//! Runs relay nodes and manages the ones co-located on this machine.
//!
//! ## Components
//!
//! - **NodeService**: one relay process (transport, hub tunnel, relay storage)
//! - **InstanceManager**: configured instances, ports and data directories
//! - **StorageManager**: disk quota checks behind a pluggable `DiskProbe`
//! - **PID files**: liveness of each instance across processes

pub mod instances;
pub mod machine;
mod node;
pub mod pid;
pub mod storage;

pub use instances::{InstanceManager, InstanceManagerConfig, NodeManagerError};
pub use machine::{machine_id, machine_id_hash};
pub use node::{needs_hub, shutdown_signal, NodeConfig, NodeService};
pub use storage::{Allocation, DiskInfo, DiskProbe, FixedProbe, FsProbe, StorageError, StorageManager};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Network error: {0}")]
    Network(#[from] mumblechat_network::NetworkError),

    #[error("Relay error: {0}")]
    Relay(#[from] mumblechat_relay::RelayError),

    #[error("Keystore error: {0}")]
    Keystore(#[from] mumblechat_keystore::KeystoreError),

    #[error("Settings error: {0}")]
    Settings(#[from] mumblechat_settings::SettingsError),

    #[error("Node manager error: {0}")]
    NodeManager(#[from] NodeManagerError),

    #[error("PID file error: {0}")]
    Pid(#[from] pid::PidError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
