//! Configuration types

use std::path::{Path, PathBuf};

use mumblechat_core::Tier;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{default_settings_path, Result, SettingsError};

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// P2P listener and liveness settings
    #[serde(default)]
    pub network: NetworkSettings,

    /// Hub tunnel settings
    #[serde(default)]
    pub hub: HubSettings,

    /// Relay node identity and resources
    #[serde(default)]
    pub node: NodeSettings,

    /// On-chain registry access
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Store-and-forward behaviour
    #[serde(default)]
    pub relay: RelaySettings,

    /// Custom settings file path (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Settings {
    /// Load settings from the default path, or create defaults
    pub fn load_or_default() -> Result<Self> {
        Self::load_from(&default_settings_path())
    }

    /// Load settings from a specific path, or create defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
            let mut settings: Settings =
                serde_json::from_str(&content).map_err(SettingsError::ParseError)?;
            settings.config_path = Some(path.to_path_buf());
            info!("Loaded settings from {:?}", path);
            Ok(settings)
        } else {
            let mut settings = Self::default();
            settings.config_path = Some(path.to_path_buf());
            Ok(settings)
        }
    }

    /// Save settings to the configured path
    pub fn save(&self) -> Result<()> {
        let path = self.config_path.clone().unwrap_or_else(default_settings_path);
        self.save_to(&path)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }

    /// Directory that holds `settings.json`; instance data lives under it
    /// unless `node.data_dir` overrides
    pub fn config_dir(&self) -> PathBuf {
        self.config_path
            .as_ref()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(mumblechat_keystore::default_config_dir)
    }
}

/// P2P network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// TCP listen port
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,

    /// WebSocket listen port (defaults to p2p_port + 1)
    #[serde(default)]
    pub ws_port: Option<u16>,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Connections beyond this are rejected at accept time
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Seed peers (`host:port`)
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,

    /// STUN servers tried in order (`host:port`)
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Peers silent for longer than this are dropped
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_secs: u64,

    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    #[serde(default = "default_true")]
    pub enable_hole_punching: bool,
}

fn default_p2p_port() -> u16 {
    19370
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_max_connections() -> usize {
    200
}

fn default_stun_servers() -> Vec<String> {
    vec![
        "stun.l.google.com:19302".to_string(),
        "stun1.l.google.com:19302".to_string(),
        "stun.cloudflare.com:3478".to_string(),
    ]
}

fn default_ping_interval() -> u64 {
    30
}

fn default_peer_timeout() -> u64 {
    120
}

fn default_maintenance_interval() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

impl NetworkSettings {
    /// Effective WebSocket port
    pub fn ws_port(&self) -> u16 {
        self.ws_port.unwrap_or(self.p2p_port.saturating_add(1))
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            p2p_port: default_p2p_port(),
            ws_port: None,
            bind_addr: default_bind_addr(),
            max_connections: default_max_connections(),
            bootstrap_peers: Vec::new(),
            stun_servers: default_stun_servers(),
            ping_interval_secs: default_ping_interval(),
            peer_timeout_secs: default_peer_timeout(),
            maintenance_interval_secs: default_maintenance_interval(),
            enable_hole_punching: true,
        }
    }
}

/// When to open the hub tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HubMode {
    /// Only when NAT discovery says we are not directly reachable
    #[default]
    Auto,
    Always,
    Never,
}

/// Hub tunnel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    #[serde(default)]
    pub enabled: HubMode,

    #[serde(default = "default_hub_url")]
    pub url: String,

    #[serde(default = "default_hub_heartbeat")]
    pub heartbeat_interval_secs: u64,

    /// Fixed delay between reconnect attempts
    #[serde(default = "default_hub_reconnect")]
    pub reconnect_interval_secs: u64,
}

fn default_hub_url() -> String {
    "wss://hub.mumblechat.com/node/connect".to_string()
}

fn default_hub_heartbeat() -> u64 {
    30
}

fn default_hub_reconnect() -> u64 {
    5
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            enabled: HubMode::default(),
            url: default_hub_url(),
            heartbeat_interval_secs: default_hub_heartbeat(),
            reconnect_interval_secs: default_hub_reconnect(),
        }
    }
}

/// Relay node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Advertised tier; derived from storage when unset
    #[serde(default)]
    pub tier: Option<Tier>,

    #[serde(default = "default_storage_mb")]
    pub storage_mb: u64,

    /// Root for per-instance data directories
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Keyfile path for single-instance runs
    #[serde(default)]
    pub keyfile: Option<String>,

    #[serde(default = "default_max_nodes")]
    pub max_nodes_per_machine: usize,

    /// First port scanned when allocating instance port ranges
    #[serde(default = "default_p2p_port")]
    pub base_port: u16,
}

fn default_storage_mb() -> u64 {
    1024
}

fn default_max_nodes() -> usize {
    4
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            tier: None,
            storage_mb: default_storage_mb(),
            data_dir: None,
            keyfile: None,
            max_nodes_per_machine: default_max_nodes(),
            base_port: default_p2p_port(),
        }
    }
}

/// Registry client mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegistryMode {
    /// In-memory state for development and tests
    #[default]
    Mock,
    /// JSON-RPC against a deployed registry contract
    Live,
}

/// On-chain registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default)]
    pub mode: RegistryMode,

    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    #[serde(default)]
    pub registry_address: String,

    #[serde(default)]
    pub token_address: String,

    /// How long resolved endpoints stay cached
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

fn default_cache_ttl() -> u64 {
    300
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            mode: RegistryMode::default(),
            rpc_url: default_rpc_url(),
            registry_address: String::new(),
            token_address: String::new(),
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

/// How a RELAY_REQUEST is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Respond immediately; storage happens in the background
    #[default]
    Accepted,
    /// Respond after storage has accepted the message
    Persisted,
}

/// Store-and-forward settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default = "default_ttl_days")]
    pub default_ttl_days: u32,

    #[serde(default = "default_max_ttl_days")]
    pub max_ttl_days: u32,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Writes within this window coalesce into one flush
    #[serde(default = "default_flush_debounce")]
    pub flush_debounce_ms: u64,

    #[serde(default)]
    pub ack_mode: AckMode,
}

fn default_ttl_days() -> u32 {
    7
}

fn default_max_ttl_days() -> u32 {
    30
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_flush_debounce() -> u64 {
    500
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            default_ttl_days: default_ttl_days(),
            max_ttl_days: default_max_ttl_days(),
            cleanup_interval_secs: default_cleanup_interval(),
            flush_debounce_ms: default_flush_debounce(),
            ack_mode: AckMode::default(),
        }
    }
}
