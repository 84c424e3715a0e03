//! Registry client for the relay registry contract
//!
//! Supports two modes:
//! - **Mock Mode**: For development/testing without a chain. State is tracked
//!   in-memory and registrations are visible immediately.
//! - **Live Mode**: JSON-RPC against a node that holds the wallet's key.
//!   Reads use `eth_call`, writes use `eth_sendTransaction`, so the private
//!   key never passes through this client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use mumblechat_core::{NodeId, Tier};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::abi::{self, selector, AbiReader, Token};
use crate::{ActiveEndpoint, NodeRecord, RegisterNode, RegistryError, Result, TxHash};

/// Registry mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryMode {
    /// Mock mode for development - state is in-memory
    Mock,
    /// Live JSON-RPC mode (requires deployed contracts)
    Live,
}

/// Registry client configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub mode: RegistryMode,
    /// JSON-RPC endpoint (only used in Live mode)
    pub rpc_url: String,
    /// Registry contract address
    pub registry_address: String,
    /// Staking token contract address
    pub token_address: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            mode: RegistryMode::Mock,
            rpc_url: "http://127.0.0.1:8545".to_string(),
            registry_address: String::new(),
            token_address: String::new(),
        }
    }
}

impl RegistryConfig {
    /// Create a mock configuration for development
    pub fn mock() -> Self {
        Self::default()
    }
}

/// In-memory state for mock mode
#[derive(Debug, Default)]
struct MockState {
    nodes: HashMap<NodeId, NodeRecord>,
    /// Approved stake by owner wallet
    allowances: HashMap<String, u128>,
    tx_counter: u64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Client for registry reads and writes on behalf of one wallet
pub struct RegistryClient {
    config: RegistryConfig,
    /// Lowercase owner wallet
    wallet: String,
    /// HTTP client (only used in Live mode)
    http: Option<reqwest::Client>,
    /// Mock state (only used in Mock mode)
    mock_state: Arc<RwLock<MockState>>,
    request_id: AtomicU64,
}

impl RegistryClient {
    pub fn new(config: RegistryConfig, wallet: &str) -> Self {
        let http = if config.mode == RegistryMode::Live {
            Some(reqwest::Client::new())
        } else {
            None
        };
        Self {
            config,
            wallet: wallet.to_lowercase(),
            http,
            mock_state: Arc::new(RwLock::new(MockState::default())),
            request_id: AtomicU64::new(1),
        }
    }

    /// Check if running in mock mode
    pub fn is_mock(&self) -> bool {
        self.config.mode == RegistryMode::Mock
    }

    /// Register a relay node.
    ///
    /// The tier follows from `storage_mb`; the wallet's approved stake must
    /// cover that tier's minimum before anything is submitted.
    pub async fn register_node_with_id(&self, req: &RegisterNode) -> Result<TxHash> {
        let tier = Tier::recommended_for(req.storage_mb)
            .ok_or(RegistryError::InsufficientStorage(req.storage_mb))?;
        let required = tier.min_stake_units();
        let approved = self.allowance().await?;
        if approved < required {
            return Err(RegistryError::InsufficientStake { required, approved });
        }

        info!(
            "Registering node {} ({} MB, {}) at {}",
            req.node_id.short(),
            req.storage_mb,
            tier,
            req.endpoint
        );

        if self.is_mock() {
            let mut state = self.mock_state.write();
            if state.nodes.contains_key(&req.node_id) {
                return Err(RegistryError::AlreadyRegistered(req.node_id.to_hex()));
            }
            let now = now_secs();
            state.nodes.insert(
                req.node_id,
                NodeRecord {
                    owner: self.wallet.clone(),
                    machine_id_hash: req.machine_id_hash,
                    storage_mb: req.storage_mb,
                    tier: Some(tier),
                    endpoint: req.endpoint.clone(),
                    is_active: true,
                    registered_at: now,
                    last_activity_at: now,
                    pending_rewards: 0,
                },
            );
            info!("[MOCK] Node {} registered", req.node_id.short());
            return Ok(Self::generate_mock_tx(&mut state));
        }

        // Live mode
        if self.is_node_registered(&req.node_id).await? {
            return Err(RegistryError::AlreadyRegistered(req.node_id.to_hex()));
        }
        let data = abi::encode_call(
            selector::REGISTER_NODE_WITH_ID,
            &[
                Token::Bytes32(*req.node_id.as_bytes()),
                Token::Bytes32(req.machine_id_hash),
                Token::Uint(req.storage_mb as u128),
                Token::String(req.endpoint.clone()),
            ],
        );
        self.send_transaction(&self.config.registry_address, data).await
    }

    pub async fn is_node_registered(&self, node_id: &NodeId) -> Result<bool> {
        if self.is_mock() {
            return Ok(self.mock_state.read().nodes.contains_key(node_id));
        }

        let data = abi::encode_call(
            selector::IS_NODE_REGISTERED,
            &[Token::Bytes32(*node_id.as_bytes())],
        );
        let out = self.eth_call(&self.config.registry_address, data).await?;
        AbiReader::new(&out).bool(0)
    }

    /// Node record, or None if the id was never registered
    pub async fn nodes(&self, node_id: &NodeId) -> Result<Option<NodeRecord>> {
        if self.is_mock() {
            return Ok(self.mock_state.read().nodes.get(node_id).cloned());
        }

        let data = abi::encode_call(selector::NODES, &[Token::Bytes32(*node_id.as_bytes())]);
        let out = self.eth_call(&self.config.registry_address, data).await?;
        let r = AbiReader::new(&out);
        let owner = r.address(0)?;
        if owner.trim_start_matches("0x").bytes().all(|b| b == b'0') {
            return Ok(None);
        }
        Ok(Some(NodeRecord {
            owner,
            machine_id_hash: r.bytes32(32)?,
            storage_mb: r.uint(64)? as u64,
            tier: Tier::from_u8(r.uint(96)? as u8),
            endpoint: r.string(128)?,
            is_active: r.bool(160)?,
            registered_at: r.uint(192)? as u64,
            last_activity_at: r.uint(224)? as u64,
            pending_rewards: r.uint(256)?,
        }))
    }

    /// Active nodes as `(nodeIds[], endpoints[], wallets[], tiers[])` zipped
    pub async fn get_active_endpoints(&self) -> Result<Vec<ActiveEndpoint>> {
        if self.is_mock() {
            let state = self.mock_state.read();
            let mut rows: Vec<(&NodeId, &NodeRecord)> =
                state.nodes.iter().filter(|(_, n)| n.is_active).collect();
            rows.sort_by_key(|(id, n)| (n.registered_at, **id));
            return Ok(rows
                .into_iter()
                .map(|(id, n)| ActiveEndpoint {
                    node_id: *id,
                    endpoint: n.endpoint.clone(),
                    wallet: n.owner.clone(),
                    tier: n.tier,
                })
                .collect());
        }

        let data = abi::encode_call(selector::GET_ACTIVE_ENDPOINTS, &[]);
        let out = self.eth_call(&self.config.registry_address, data).await?;
        let r = AbiReader::new(&out);
        let ids = r.array(0, |e, off| e.bytes32(off))?;
        let endpoints = r.array(32, |e, off| e.string(off))?;
        let wallets = r.array(64, |e, off| e.address(off))?;
        let tiers = r.array(96, |e, off| e.uint(off))?;
        if ids.len() != endpoints.len() || ids.len() != wallets.len() || ids.len() != tiers.len() {
            return Err(RegistryError::Abi("active endpoint arrays differ in length".to_string()));
        }

        Ok(ids
            .into_iter()
            .zip(endpoints)
            .zip(wallets)
            .zip(tiers)
            .map(|(((id, endpoint), wallet), tier)| ActiveEndpoint {
                node_id: NodeId::from_bytes(id),
                endpoint,
                wallet,
                tier: Tier::from_u8(tier as u8),
            })
            .collect())
    }

    /// Approve the registry to pull `amount` base units of the staking token
    pub async fn approve_stake(&self, amount: u128) -> Result<TxHash> {
        info!("Approving stake of {} for {}", amount, self.wallet);

        if self.is_mock() {
            let mut state = self.mock_state.write();
            state.allowances.insert(self.wallet.clone(), amount);
            return Ok(Self::generate_mock_tx(&mut state));
        }

        let spender = abi::parse_address(&self.config.registry_address)?;
        let data = abi::encode_call(
            selector::APPROVE,
            &[Token::Address(spender), Token::Uint(amount)],
        );
        self.send_transaction(&self.config.token_address, data).await
    }

    /// Stake this wallet has approved for the registry
    pub async fn allowance(&self) -> Result<u128> {
        if self.is_mock() {
            return Ok(self
                .mock_state
                .read()
                .allowances
                .get(&self.wallet)
                .copied()
                .unwrap_or(0));
        }

        let owner = abi::parse_address(&self.wallet)?;
        let spender = abi::parse_address(&self.config.registry_address)?;
        let data = abi::encode_call(
            selector::ALLOWANCE,
            &[Token::Address(owner), Token::Address(spender)],
        );
        let out = self.eth_call(&self.config.token_address, data).await?;
        AbiReader::new(&out).uint(0)
    }

    /// Generate mock transaction hash (when already holding lock)
    fn generate_mock_tx(state: &mut MockState) -> TxHash {
        state.tx_counter += 1;
        format!("0x{:064x}", state.tx_counter)
    }

    async fn eth_call(&self, to: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        let params = json!([{ "to": to, "data": format!("0x{}", hex::encode(data)) }, "latest"]);
        let result = self.rpc("eth_call", params).await?;
        let hex_str = result
            .as_str()
            .ok_or_else(|| RegistryError::RpcError("eth_call result is not a string".to_string()))?;
        abi::decode_hex_result(hex_str)
    }

    async fn send_transaction(&self, to: &str, data: Vec<u8>) -> Result<TxHash> {
        let params = json!([{
            "from": self.wallet,
            "to": to,
            "data": format!("0x{}", hex::encode(data)),
        }]);
        let result = self
            .rpc("eth_sendTransaction", params)
            .await
            .map_err(|e| match e {
                RegistryError::RpcError(msg) => RegistryError::TransactionFailed(msg),
                other => other,
            })?;
        let hash = result
            .as_str()
            .ok_or_else(|| RegistryError::TransactionFailed("missing transaction hash".to_string()))?
            .to_string();
        info!("Submitted transaction {}", hash);
        Ok(hash)
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let http = self
            .http
            .as_ref()
            .ok_or_else(|| RegistryError::RpcError("RPC client not initialized".to_string()))?;
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        debug!("RPC {} #{}", method, id);

        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let resp: RpcResponse = http
            .post(&self.config.rpc_url)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = resp.error {
            return Err(RegistryError::RpcError(format!("{}: {} ({})", method, err.message, err.code)));
        }
        resp.result
            .ok_or_else(|| RegistryError::RpcError(format!("{}: empty result", method)))
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
