//! MumbleChat Network
//!
//! Peer-to-peer plumbing for relay nodes.
//!
//! ## Features
//!
//! - Length-prefixed frame codec shared by TCP, WebSocket and UDP sessions
//! - Signed handshake and per-connection authentication
//! - Kademlia-style routing table with rate-limited queries
//! - STUN discovery, NAT classification and relayed UDP hole punching
//! - Bootstrap from peer cache, registry endpoints and seeds
//! - Outbound hub tunnel for nodes that cannot accept connections

mod bootstrap;
mod codec;
mod dedup;
mod dht;
mod error;
mod hole_punch;
pub mod hub;
mod peer_cache;
mod protocol;
mod ratelimit;
pub mod stun;
mod transport;

pub use bootstrap::{BootstrapCandidate, BootstrapManager, CandidateSource, EndpointSource};
pub use codec::{encode_frame, CodecError, Frame, FrameDecoder, FrameType, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use dedup::MessageIdCache;
pub use dht::{bucket_index, random_id_for_bucket, Dht, RoutingTable, StoreOutcome, BUCKET_STALE_THRESHOLD, K};
pub use error::{NetworkError, Result};
pub use hole_punch::{HolePunchConfig, HolePunchError, HolePuncher, PunchCoordinator};
pub use hub::{HubConfig, HubConnection, HubError, HubEvent, HubMessage, HubTunnel};
pub use peer_cache::{CachedPeer, PeerCache, MAX_CACHED_PEERS, MAX_CONSECUTIVE_FAILURES};
pub use protocol::{
    FindNode, HandshakeAck, HandshakePayload, PeerExchange, PeerRecord, PingPayload,
    ProtocolMessage, PunchRequest, RelayResponse, SyncRequest,
};
pub use ratelimit::PeerRateLimiter;
pub use stun::{NatType, StunClient, StunConfig, StunError, StunMapping};
pub use transport::{
    ConnectionId, ConnectionKind, Direction, P2PTransport, PeerInfo, RelayAckMode,
    TransportConfig, TransportEvent,
};
