//! Co-located relay instances
//!
//! Each instance has its own wallet key, data directory and 100-wide port
//! range. The instance list lives in `nodes.json` under the manager root.
//! A rejected `add_node` leaves no directory, lock file or list entry behind.
//!
//! Every change holds an exclusive lock on `nodes.lock` from re-reading the
//! list through saving it, so two CLI processes cannot hand out the same
//! ports or overwrite each other's entries.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use mumblechat_core::{now_millis, InstanceStatus, MachineStorageInfo, NodeInstance, Tier};
use mumblechat_crypto::{NodeIdentity, SigningKeypair};
use mumblechat_keystore::{save_keypair_bytes, KeystoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::machine::machine_id;
use crate::pid::running_pid;
use crate::storage::{StorageError, StorageManager};

/// Distance between the base ports of two instances
pub const PORT_STEP: u16 = 100;
pub const WS_PORT_OFFSET: u16 = 1;
pub const API_PORT_OFFSET: u16 = 10;

const NODES_FILE: &str = "nodes.json";
const LIST_LOCK_FILE: &str = "nodes.lock";

/// How long a change waits for another process to release the list
const LIST_LOCK_WAIT: Duration = Duration::from_secs(5);
const INSTANCE_SUBDIRS: [&str; 4] = ["data", "cache", "logs", "keys"];

#[derive(Error, Debug)]
pub enum NodeManagerError {
    #[error("Machine already hosts the maximum of {0} nodes")]
    MaxNodesReached(usize),

    #[error("Insufficient storage: requested {requested_mb} MB, {available_mb} MB available")]
    InsufficientStorage { requested_mb: u64, available_mb: u64 },

    #[error("Storage of {storage_mb} MB is below the {tier} minimum")]
    StorageBelowTier { tier: Tier, storage_mb: u64 },

    #[error("No free port range at or above {0}")]
    NoFreePorts(u16),

    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Node {0} is already configured")]
    AlreadyExists(String),

    #[error("Node {0} is running; stop it first")]
    Running(String),

    #[error("Node list {0:?} is locked by another process")]
    ListLocked(PathBuf),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Keystore error: {0}")]
    Keystore(#[from] KeystoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NodeManagerError {
    /// Failures the operator can fix by freeing disk or removing a node
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            NodeManagerError::InsufficientStorage { .. }
                | NodeManagerError::StorageBelowTier { .. }
                | NodeManagerError::MaxNodesReached(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, NodeManagerError>;

#[derive(Debug, Clone)]
pub struct InstanceManagerConfig {
    /// Holds `nodes.json` and the `nodes/` data directories
    pub root: PathBuf,
    pub base_port: u16,
    pub max_nodes: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NodesFile {
    #[serde(default)]
    nodes: Vec<NodeInstance>,
}

/// Files inside an instance's data directory
pub fn key_path(instance: &NodeInstance) -> PathBuf {
    instance.data_path.join("keys").join("node.key")
}

pub fn store_path(instance: &NodeInstance) -> PathBuf {
    instance.data_path.join("data").join("messages.json")
}

pub fn peer_cache_path(instance: &NodeInstance) -> PathBuf {
    instance.data_path.join("cache").join("peers.json")
}

pub fn log_path(instance: &NodeInstance) -> PathBuf {
    instance.data_path.join("logs").join("node.log")
}

/// Exclusive hold on the instance list; released on drop
struct ListLock {
    file: File,
}

impl Drop for ListLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

pub struct InstanceManager {
    config: InstanceManagerConfig,
    storage: StorageManager,
    instances: Vec<NodeInstance>,
}

impl InstanceManager {
    pub fn open(config: InstanceManagerConfig, storage: StorageManager) -> Result<Self> {
        let instances = read_list(&config.root)?;
        Ok(Self {
            config,
            storage,
            instances,
        })
    }

    /// Lock the list and pick up changes made by other processes
    fn begin_change(&mut self) -> Result<ListLock> {
        std::fs::create_dir_all(&self.config.root)?;
        let path = self.config.root.join(LIST_LOCK_FILE);
        let file = OpenOptions::new().create(true).write(true).open(&path)?;
        let started = Instant::now();
        while file.try_lock_exclusive().is_err() {
            if started.elapsed() >= LIST_LOCK_WAIT {
                return Err(NodeManagerError::ListLocked(path));
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        let lock = ListLock { file };
        self.instances = read_list(&self.config.root)?;
        Ok(lock)
    }

    pub fn instances(&self) -> &[NodeInstance] {
        &self.instances
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    /// Look up by node id hex (or a prefix of at least 6 chars) or wallet
    pub fn get(&self, id: &str) -> Option<&NodeInstance> {
        self.position(id).map(|i| &self.instances[i])
    }

    fn position(&self, id: &str) -> Option<usize> {
        let needle = id.trim().trim_start_matches("0x").to_lowercase();
        if needle.is_empty() {
            return None;
        }
        self.instances.iter().position(|n| {
            n.wallet_address.trim_start_matches("0x").eq_ignore_ascii_case(&needle)
                || (needle.len() >= 6 && n.node_id.to_hex().starts_with(&needle))
        })
    }

    pub fn total_allocated_mb(&self) -> u64 {
        self.instances.iter().map(|n| n.storage_mb).sum()
    }

    /// First `(p2p, ws, api)` triple, scanning up from the base port, that
    /// collides with no configured instance
    pub fn allocate_ports(&self) -> Result<(u16, u16, u16)> {
        let mut p2p = self.config.base_port;
        loop {
            let api = p2p
                .checked_add(API_PORT_OFFSET)
                .ok_or(NodeManagerError::NoFreePorts(self.config.base_port))?;
            let triple = [p2p, p2p + WS_PORT_OFFSET, api];
            if !self.instances.iter().any(|n| n.overlaps(&triple)) {
                return Ok((p2p, p2p + WS_PORT_OFFSET, api));
            }
            p2p = p2p
                .checked_add(PORT_STEP)
                .ok_or(NodeManagerError::NoFreePorts(self.config.base_port))?;
        }
    }

    /// Configure a new instance owned by `keypair`'s wallet.
    ///
    /// `tier` defaults to the largest tier `storage_mb` qualifies for.
    pub fn add_node(
        &mut self,
        keypair: SigningKeypair,
        tier: Option<Tier>,
        storage_mb: u64,
    ) -> Result<NodeInstance> {
        let _lock = self.begin_change()?;
        if self.instances.len() >= self.config.max_nodes {
            return Err(NodeManagerError::MaxNodesReached(self.config.max_nodes));
        }

        let tier = match tier.or_else(|| Tier::recommended_for(storage_mb)) {
            Some(t) if storage_mb >= t.min_storage_mb() => t,
            Some(t) => return Err(NodeManagerError::StorageBelowTier { tier: t, storage_mb }),
            None => {
                return Err(NodeManagerError::StorageBelowTier {
                    tier: Tier::Bronze,
                    storage_mb,
                })
            }
        };

        let check = self
            .storage
            .can_allocate_storage(storage_mb, self.total_allocated_mb())?;
        if !check.ok {
            return Err(NodeManagerError::InsufficientStorage {
                requested_mb: storage_mb,
                available_mb: check.available_mb,
            });
        }

        let secret = keypair.secret_key_bytes();
        let identity = NodeIdentity::from_keypair(keypair);
        if self.get(&identity.wallet_address).is_some() {
            return Err(NodeManagerError::AlreadyExists(identity.wallet_address));
        }

        let (p2p_port, ws_port, api_port) = self.allocate_ports()?;
        let data_path = self
            .config
            .root
            .join("nodes")
            .join(&identity.node_id.to_hex()[..16]);

        let instance = NodeInstance {
            node_id: identity.node_id,
            wallet_address: identity.wallet_address.clone(),
            tier,
            storage_mb,
            p2p_port,
            ws_port,
            api_port,
            data_path: data_path.clone(),
            status: InstanceStatus::Stopped,
            registered: false,
            created_at: now_millis(),
        };

        if let Err(e) = self.init_instance_dir(&instance, &secret) {
            let _ = std::fs::remove_dir_all(&data_path);
            return Err(e);
        }

        self.instances.push(instance.clone());
        if let Err(e) = self.save() {
            self.instances.pop();
            let _ = std::fs::remove_dir_all(&data_path);
            return Err(e);
        }

        info!(
            "Added node {} ({}, {} MB) on ports {}/{}/{}",
            instance.node_id.short(),
            tier,
            storage_mb,
            p2p_port,
            ws_port,
            api_port
        );
        Ok(instance)
    }

    fn init_instance_dir(&self, instance: &NodeInstance, secret: &[u8; 32]) -> Result<()> {
        if instance.data_path.exists() {
            return Err(NodeManagerError::AlreadyExists(instance.node_id.to_hex()));
        }
        for sub in INSTANCE_SUBDIRS {
            std::fs::create_dir_all(instance.data_path.join(sub))?;
        }
        save_keypair_bytes(&key_path(instance), secret)?;
        self.storage
            .lock_storage(&instance.data_path, instance.storage_mb)?;
        Ok(())
    }

    /// Remove a stopped instance; `purge` also deletes its data directory
    pub fn remove_node(&mut self, id: &str, purge: bool) -> Result<NodeInstance> {
        let _lock = self.begin_change()?;
        let idx = self
            .position(id)
            .ok_or_else(|| NodeManagerError::NotFound(id.to_string()))?;
        if running_pid(&self.instances[idx].data_path).is_some() {
            return Err(NodeManagerError::Running(self.instances[idx].node_id.short()));
        }

        let removed = self.instances.remove(idx);
        if let Err(e) = self.save() {
            self.instances.insert(idx, removed);
            return Err(e);
        }

        if let Err(e) = self.storage.release_storage(&removed.data_path) {
            warn!("Failed to release storage for {}: {}", removed.node_id.short(), e);
        }
        if purge {
            std::fs::remove_dir_all(&removed.data_path)?;
            info!("Removed node {} and its data", removed.node_id.short());
        } else {
            info!("Removed node {}; data kept in {:?}", removed.node_id.short(), removed.data_path);
        }
        Ok(removed)
    }

    /// Re-check PID files; stale ones count as stopped
    pub fn refresh_status(&mut self) -> Result<()> {
        let _lock = self.begin_change()?;
        let mut changed = false;
        for inst in &mut self.instances {
            let status = if running_pid(&inst.data_path).is_some() {
                InstanceStatus::Running
            } else if inst.status == InstanceStatus::Error {
                InstanceStatus::Error
            } else {
                InstanceStatus::Stopped
            };
            if status != inst.status {
                inst.status = status;
                changed = true;
            }
        }
        if changed {
            self.save()?;
        }
        Ok(())
    }

    pub fn set_status(&mut self, id: &str, status: InstanceStatus) -> Result<()> {
        let _lock = self.begin_change()?;
        let idx = self
            .position(id)
            .ok_or_else(|| NodeManagerError::NotFound(id.to_string()))?;
        self.instances[idx].status = status;
        self.save()
    }

    pub fn mark_registered(&mut self, id: &str) -> Result<()> {
        let _lock = self.begin_change()?;
        let idx = self
            .position(id)
            .ok_or_else(|| NodeManagerError::NotFound(id.to_string()))?;
        self.instances[idx].registered = true;
        self.save()
    }

    pub fn machine_info(&self) -> Result<MachineStorageInfo> {
        let disk = self.storage.get_disk_info()?;
        let allocated_mb = self.total_allocated_mb();
        let available = self.storage.available_mb(allocated_mb)?;
        let used_mb = self
            .instances
            .iter()
            .map(|n| dir_size(&n.data_path.join("data")))
            .sum::<u64>()
            / (1024 * 1024);
        Ok(MachineStorageInfo {
            machine_id: machine_id().to_string(),
            disk_total_mb: disk.total_mb(),
            disk_free_mb: disk.free_mb(),
            safety_buffer_mb: StorageManager::safety_buffer_mb(&disk),
            allocated_mb,
            used_mb,
            node_count: self.instances.len(),
            available_for_new_nodes_mb: available,
            recommended_tier: Tier::recommended_for(available),
        })
    }

    fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config.root)?;
        let path = self.config.root.join(NODES_FILE);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(&NodesFile {
            nodes: self.instances.clone(),
        })?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn read_list(root: &Path) -> Result<Vec<NodeInstance>> {
    match std::fs::read_to_string(root.join(NODES_FILE)) {
        Ok(content) => Ok(serde_json::from_str::<NodesFile>(&content)?.nodes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| match e.metadata() {
            Ok(m) if m.is_dir() => dir_size(&e.path()),
            Ok(m) => m.len(),
            Err(_) => 0,
        })
        .sum()
}
