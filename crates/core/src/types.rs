use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{MumbleChatError, Result};

/// Milliseconds in one day
pub const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Stable 32-byte node identity derived from a wallet address.
///
/// Used as the Kademlia key and for message addressing. Serialized as a
/// lowercase hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub const LEN: usize = 32;

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let trimmed = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(trimmed).map_err(|_| MumbleChatError::InvalidNodeId(s.to_string()))?;
        if bytes.len() != Self::LEN {
            return Err(MumbleChatError::InvalidNodeId(s.to_string()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    /// XOR distance to another id
    pub fn xor_distance(&self, other: &NodeId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Short form for logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for NodeId {
    type Err = MumbleChatError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde helper: `Vec<u8>` as standard base64
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// End-to-end encrypted chat message as it travels between peers.
///
/// The relay never looks inside `encrypted_blob`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub message_id: String,
    pub sender_address: String,
    pub recipient_address: String,
    #[serde(with = "base64_bytes")]
    pub encrypted_blob: Vec<u8>,
    pub timestamp: u64,
    /// Hex-encoded Ed25519 signature over [`MessageEnvelope::signable_data`]
    pub signature: String,
}

impl MessageEnvelope {
    /// `message:<id>:<sender>:<recipient>:<timestamp>` with lowercase addresses
    pub fn signable_data(
        message_id: &str,
        sender: &str,
        recipient: &str,
        timestamp: u64,
    ) -> Vec<u8> {
        format!(
            "message:{}:{}:{}:{}",
            message_id,
            sender.to_lowercase(),
            recipient.to_lowercase(),
            timestamp
        )
        .into_bytes()
    }
}

/// Request to hold a message for an offline recipient.
///
/// Identities are key hashes, never plaintext addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    pub message_id: String,
    pub recipient_key_hash: String,
    /// Filled in by the receiving relay from the authenticated peer
    #[serde(default)]
    pub sender_key_hash: String,
    #[serde(with = "base64_bytes")]
    pub encrypted_blob: Vec<u8>,
    pub ttl_days: u32,
    pub timestamp: u64,
    #[serde(default)]
    pub signature: String,
}

/// A message held by a relay until pickup or expiry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    /// Sender key hash
    pub from: String,
    /// Recipient key hash
    pub to: String,
    #[serde(with = "base64_bytes")]
    pub encrypted_content: Vec<u8>,
    pub timestamp: u64,
    pub expires_at: u64,
    #[serde(default)]
    pub delivered: bool,
    #[serde(default)]
    pub delivered_at: Option<u64>,
}

impl StoredMessage {
    /// Build a stored row from a relay request received at `now_ms`.
    ///
    /// `ttl_days` is clamped to `1..=max_ttl_days`.
    pub fn from_relay_request(request: &RelayRequest, now_ms: u64, max_ttl_days: u32) -> Self {
        let ttl_days = request.ttl_days.clamp(1, max_ttl_days.max(1)) as u64;
        Self {
            id: request.message_id.clone(),
            from: request.sender_key_hash.clone(),
            to: request.recipient_key_hash.clone(),
            encrypted_content: request.encrypted_blob.clone(),
            timestamp: now_ms,
            expires_at: now_ms + ttl_days * DAY_MS,
            delivered: false,
            delivered_at: None,
        }
    }

    /// Whether the row is past its expiry at `now_ms`
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at <= now_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_hex_roundtrip() {
        let id = NodeId::from_bytes([0xab; 32]);
        let parsed = NodeId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
        assert!(NodeId::from_hex(&format!("0x{}", id.to_hex())).is_ok());
    }

    #[test]
    fn test_node_id_rejects_wrong_length() {
        assert!(NodeId::from_hex("abcd").is_err());
        assert!(NodeId::from_hex("not-hex").is_err());
    }

    #[test]
    fn test_xor_distance_to_self_is_zero() {
        let id = NodeId::from_bytes([7u8; 32]);
        assert_eq!(id.xor_distance(&id), [0u8; 32]);
    }

    #[test]
    fn test_node_id_serde_as_string() {
        let id = NodeId::from_bytes([1u8; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
    }

    #[test]
    fn test_envelope_json_uses_camel_case_and_base64() {
        let env = MessageEnvelope {
            message_id: "m1".to_string(),
            sender_address: "0xaa".to_string(),
            recipient_address: "0xbb".to_string(),
            encrypted_blob: vec![1, 2, 3],
            timestamp: 5,
            signature: String::new(),
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["messageId"], "m1");
        assert_eq!(json["encryptedBlob"], "AQID");
    }

    #[test]
    fn test_stored_message_ttl_clamped() {
        let req = RelayRequest {
            message_id: "m".to_string(),
            recipient_key_hash: "r".to_string(),
            sender_key_hash: "s".to_string(),
            encrypted_blob: vec![],
            ttl_days: 365,
            timestamp: 0,
            signature: String::new(),
        };
        let stored = StoredMessage::from_relay_request(&req, 1_000, 30);
        assert_eq!(stored.expires_at, 1_000 + 30 * DAY_MS);

        let zero = RelayRequest { ttl_days: 0, ..req };
        let stored = StoredMessage::from_relay_request(&zero, 1_000, 30);
        assert_eq!(stored.expires_at, 1_000 + DAY_MS);
    }

    #[test]
    fn test_stored_message_expiry_boundary() {
        let msg = StoredMessage {
            id: "x".to_string(),
            from: String::new(),
            to: String::new(),
            encrypted_content: vec![],
            timestamp: 0,
            expires_at: 100,
            delivered: false,
            delivered_at: None,
        };
        assert!(!msg.is_expired(99));
        assert!(msg.is_expired(100));
    }
}
