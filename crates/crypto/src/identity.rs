//! Wallet-style identities.
//!
//! A node's wallet address is derived from its Ed25519 public key, and its
//! [`NodeId`] from the wallet address. Peers prove ownership of an address in
//! the handshake by signing `handshake:<wallet>:<timestamp>`.

use mumblechat_core::{MumbleChatError, NodeId, Result};

use crate::keys::{hash, SigningKeypair};
use crate::sign::{sign_data, verify_hex_signature};

/// Maximum clock skew accepted on handshake timestamps (ms)
pub const MAX_HANDSHAKE_SKEW_MS: u64 = 5 * 60 * 1000;

/// `0x` + hex of the last 20 bytes of sha256(pubkey)
pub fn wallet_address(pubkey: &[u8; 32]) -> String {
    let digest = hash(pubkey);
    format!("0x{}", hex::encode(&digest[12..]))
}

/// Whether `s` looks like a `0x`-prefixed 20-byte address
pub fn is_valid_address(s: &str) -> bool {
    match s.strip_prefix("0x") {
        Some(rest) => rest.len() == 40 && rest.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

/// NodeId = sha256(lowercase wallet address)
pub fn node_id_from_wallet(wallet: &str) -> NodeId {
    NodeId::from_bytes(hash(wallet.to_lowercase().as_bytes()))
}

/// Hex sha256 of `mumblechat:<lowercase address>`; used in relay requests in
/// place of the plaintext address
pub fn key_hash(wallet: &str) -> String {
    hex::encode(hash(format!("mumblechat:{}", wallet.to_lowercase()).as_bytes()))
}

/// Whether `s` has the shape of a [`key_hash`]: 64 lowercase hex characters
pub fn is_key_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Bytes signed by a peer in its handshake
pub fn handshake_signable(wallet: &str, timestamp: u64) -> Vec<u8> {
    format!("handshake:{}:{}", wallet.to_lowercase(), timestamp).into_bytes()
}

/// Check a handshake claim.
///
/// The public key must hash to the claimed wallet, the timestamp must be
/// within [`MAX_HANDSHAKE_SKEW_MS`] of `now_ms`, and the signature must verify.
pub fn verify_handshake(
    wallet: &str,
    pubkey: &[u8; 32],
    timestamp: u64,
    signature_hex: &str,
    now_ms: u64,
) -> Result<()> {
    if !is_valid_address(wallet) {
        return Err(MumbleChatError::InvalidAddress(wallet.to_string()));
    }
    if wallet_address(pubkey) != wallet.to_lowercase() {
        return Err(MumbleChatError::InvalidPublicKey);
    }
    if now_ms.abs_diff(timestamp) > MAX_HANDSHAKE_SKEW_MS {
        return Err(MumbleChatError::Timeout);
    }
    if !verify_hex_signature(pubkey, &handshake_signable(wallet, timestamp), signature_hex) {
        return Err(MumbleChatError::InvalidSignature);
    }
    Ok(())
}

/// A node's full identity: keypair plus derived address and id
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub keypair: SigningKeypair,
    pub wallet_address: String,
    pub node_id: NodeId,
}

impl NodeIdentity {
    pub fn from_keypair(keypair: SigningKeypair) -> Self {
        let wallet_address = wallet_address(&keypair.public_key_bytes());
        let node_id = node_id_from_wallet(&wallet_address);
        Self {
            keypair,
            wallet_address,
            node_id,
        }
    }

    pub fn generate() -> Self {
        Self::from_keypair(SigningKeypair::generate())
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public_key_bytes()
    }

    pub fn key_hash(&self) -> String {
        key_hash(&self.wallet_address)
    }

    /// Hex signature over the handshake bytes for `timestamp`
    pub fn sign_handshake(&self, timestamp: u64) -> String {
        let data = handshake_signable(&self.wallet_address, timestamp);
        hex::encode(sign_data(&self.keypair, &data))
    }
}
