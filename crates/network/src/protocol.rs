//! Protocol messages carried inside frames
//!
//! Every payload is camelCase JSON; binary fields are base64.

use bytes::Bytes;
use mumblechat_core::{MessageEnvelope, MumbleChatError, NodeId, RelayRequest};
use mumblechat_crypto::{verify_handshake, NodeIdentity};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::{encode_frame, CodecError, Frame, FrameType, Result};

/// Signed identity claim sent by both sides of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePayload {
    pub wallet_address: String,
    /// Hex-encoded Ed25519 public key
    pub public_key: String,
    /// Milliseconds since epoch
    pub timestamp: u64,
    /// Hex signature over `handshake:<wallet>:<timestamp>`
    pub signature: String,
    /// TCP port the sender accepts connections on, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
}

impl HandshakePayload {
    /// Fresh claim for `identity`, signed at `timestamp`
    pub fn signed(identity: &NodeIdentity, timestamp: u64, listen_port: Option<u16>) -> Self {
        Self {
            wallet_address: identity.wallet_address.clone(),
            public_key: hex::encode(identity.public_key()),
            timestamp,
            signature: identity.sign_handshake(timestamp),
            listen_port,
        }
    }

    /// Check the claim at `now_ms`; returns the sender's public key
    pub fn verify(&self, now_ms: u64) -> mumblechat_core::Result<[u8; 32]> {
        let bytes = hex::decode(&self.public_key).map_err(|_| MumbleChatError::InvalidPublicKey)?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| MumbleChatError::InvalidPublicKey)?;
        verify_handshake(&self.wallet_address, &key, self.timestamp, &self.signature, now_ms)?;
        Ok(key)
    }
}

/// Reply to a handshake; carries the responder's own claim on success
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAck {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake: Option<HandshakePayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayResponse {
    pub message_id: String,
    pub accepted: bool,
    /// True once the message is held in relay storage
    pub stored: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A known peer as exchanged over the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub node_id: NodeId,
    #[serde(default)]
    pub wallet_address: String,
    /// `ip:port` the peer accepts TCP connections on
    pub address: String,
    #[serde(default)]
    pub last_seen: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerExchange {
    /// True asks the remote for its peers; false carries an answer
    pub request: bool,
    #[serde(default)]
    pub peers: Vec<PeerRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindNode {
    pub target: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Only messages stored at or after this time (ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
}

/// Rendezvous for a UDP hole punch, relayed by a peer both sides share.
///
/// `endpoint` is the sender's STUN-discovered `ip:port` for the socket it
/// will punch from. A relaying node overwrites `origin` with the node id of
/// the authenticated connection the request arrived on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PunchRequest {
    pub target: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<NodeId>,
    pub endpoint: String,
    /// True when answering a request rather than opening one
    #[serde(default)]
    pub reply: bool,
}

/// Typed view of a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    Handshake(HandshakePayload),
    HandshakeAck(HandshakeAck),
    Ping(PingPayload),
    Pong(PingPayload),
    Message(MessageEnvelope),
    RelayRequest(RelayRequest),
    RelayResponse(RelayResponse),
    PeerExchange(PeerExchange),
    FindNode(FindNode),
    SyncRequest(SyncRequest),
    PunchRequest(PunchRequest),
}

impl ProtocolMessage {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Handshake(_) => FrameType::Handshake,
            Self::HandshakeAck(_) => FrameType::HandshakeAck,
            Self::Ping(_) => FrameType::Ping,
            Self::Pong(_) => FrameType::Pong,
            Self::Message(_) => FrameType::Message,
            Self::RelayRequest(_) => FrameType::RelayRequest,
            Self::RelayResponse(_) => FrameType::RelayResponse,
            Self::PeerExchange(_) => FrameType::PeerExchange,
            Self::FindNode(_) => FrameType::DhtFindNode,
            Self::SyncRequest(_) => FrameType::SyncRequest,
            Self::PunchRequest(_) => FrameType::PunchRequest,
        }
    }

    /// Serialize into a frame
    pub fn to_frame(&self) -> Result<Frame> {
        let t = self.frame_type();
        let payload = match self {
            Self::Handshake(p) => to_json(t, p)?,
            Self::HandshakeAck(p) => to_json(t, p)?,
            Self::Ping(p) | Self::Pong(p) => to_json(t, p)?,
            Self::Message(p) => to_json(t, p)?,
            Self::RelayRequest(p) => to_json(t, p)?,
            Self::RelayResponse(p) => to_json(t, p)?,
            Self::PeerExchange(p) => to_json(t, p)?,
            Self::FindNode(p) => to_json(t, p)?,
            Self::SyncRequest(p) => to_json(t, p)?,
            Self::PunchRequest(p) => to_json(t, p)?,
        };
        Ok(Frame::new(t, payload))
    }

    /// Serialize straight to wire bytes
    pub fn encode(&self) -> Result<Bytes> {
        encode_frame(&self.to_frame()?)
    }

    /// Parse a frame. Unknown types and malformed payloads fail for this
    /// frame only.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let t = frame.frame_type()?;
        let bytes = &frame.payload[..];
        Ok(match t {
            FrameType::Handshake => Self::Handshake(from_json(t, bytes)?),
            FrameType::HandshakeAck => Self::HandshakeAck(from_json(t, bytes)?),
            FrameType::Ping => Self::Ping(from_json(t, bytes)?),
            FrameType::Pong => Self::Pong(from_json(t, bytes)?),
            FrameType::Message => Self::Message(from_json(t, bytes)?),
            FrameType::RelayRequest => Self::RelayRequest(from_json(t, bytes)?),
            FrameType::RelayResponse => Self::RelayResponse(from_json(t, bytes)?),
            FrameType::PeerExchange => Self::PeerExchange(from_json(t, bytes)?),
            FrameType::DhtFindNode => Self::FindNode(from_json(t, bytes)?),
            FrameType::SyncRequest => Self::SyncRequest(from_json(t, bytes)?),
            FrameType::PunchRequest => Self::PunchRequest(from_json(t, bytes)?),
        })
    }
}

fn to_json<T: Serialize>(t: FrameType, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| CodecError::MalformedPayload(t, e.to_string()))
}

fn from_json<T: DeserializeOwned>(t: FrameType, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::MalformedPayload(t, e.to_string()))
}
