//! UDP hole punching
//!
//! Both sides send PUNCH probes at each other's STUN-discovered mapping.
//! A side that receives a probe answers with PUNCH_ACK; receiving either a
//! probe or an ack from the expected peer means the binding is open. Probes
//! are resent with exponential backoff and the whole attempt is bounded by a
//! deadline so the caller can fall back to the hub tunnel.
//!
//! [`PunchCoordinator`] runs the rendezvous: each side binds a fresh socket,
//! learns its mapping from STUN, and the two mappings are swapped in
//! PUNCH_REQUEST frames relayed by a peer both sides are connected to. Once
//! the binding is open the same socket carries a UDP session on the
//! transport.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use mumblechat_core::NodeId;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::NetworkError;
use crate::stun::{StunClient, StunError};
use crate::transport::{ConnectionId, ConnectionKind, P2PTransport, PeerInfo};

const PUNCH_MAGIC: &[u8; 4] = b"MCHP";
const KIND_PUNCH: u8 = 1;
const KIND_ACK: u8 = 2;
const PACKET_LEN: usize = 4 + 1 + 32;

#[derive(Error, Debug)]
pub enum HolePunchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hole punch to {0} timed out")]
    Timeout(SocketAddr),

    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    #[error("Transport error: {0}")]
    Transport(#[from] NetworkError),

    #[error("No connected peer to relay the punch request")]
    NoRendezvous,

    #[error("No punch answer from {0}")]
    NoAnswer(String),

    #[error("Invalid punch endpoint {0}")]
    BadEndpoint(String),
}

pub type Result<T> = std::result::Result<T, HolePunchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PunchKind {
    Punch,
    Ack,
}

fn encode_packet(kind: PunchKind, sender: &NodeId) -> [u8; PACKET_LEN] {
    let mut buf = [0u8; PACKET_LEN];
    buf[..4].copy_from_slice(PUNCH_MAGIC);
    buf[4] = match kind {
        PunchKind::Punch => KIND_PUNCH,
        PunchKind::Ack => KIND_ACK,
    };
    buf[5..].copy_from_slice(sender.as_bytes());
    buf
}

fn decode_packet(data: &[u8]) -> Option<(PunchKind, NodeId)> {
    if data.len() != PACKET_LEN || &data[..4] != PUNCH_MAGIC {
        return None;
    }
    let kind = match data[4] {
        KIND_PUNCH => PunchKind::Punch,
        KIND_ACK => PunchKind::Ack,
        _ => return None,
    };
    let mut id = [0u8; 32];
    id.copy_from_slice(&data[5..]);
    Some((kind, NodeId::from_bytes(id)))
}

/// Retry schedule for a punch attempt
#[derive(Debug, Clone)]
pub struct HolePunchConfig {
    /// Delay before the first resend
    pub initial_interval: Duration,
    /// Upper bound on the resend delay
    pub max_interval: Duration,
    /// Maximum probes sent
    pub max_attempts: u32,
    /// Overall give-up time
    pub deadline: Duration,
}

impl Default for HolePunchConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            max_attempts: 12,
            deadline: Duration::from_secs(8),
        }
    }
}

/// Peers a punch request is sent through
const RENDEZVOUS_FANOUT: usize = 3;

/// Drives punch attempts from one local socket
pub struct HolePuncher {
    local_id: NodeId,
    config: HolePunchConfig,
}

impl HolePuncher {
    pub fn new(local_id: NodeId, config: HolePunchConfig) -> Self {
        Self { local_id, config }
    }

    /// Open a binding to `peer_addr`, expecting `peer_id` on the other side.
    ///
    /// Returns the address the peer's packets actually arrived from (may
    /// differ in port from `peer_addr` behind some NATs).
    pub async fn punch(
        &self,
        socket: &UdpSocket,
        peer_addr: SocketAddr,
        peer_id: &NodeId,
    ) -> Result<SocketAddr> {
        let start = Instant::now();
        let deadline = start + self.config.deadline;
        let probe = encode_packet(PunchKind::Punch, &self.local_id);
        let ack = encode_packet(PunchKind::Ack, &self.local_id);

        let mut interval = self.config.initial_interval;
        let mut sent = 0u32;
        let mut next_send = start;
        let mut buf = [0u8; 64];

        loop {
            let now = Instant::now();
            if now >= deadline {
                debug!("Hole punch to {} gave up after {} probes", peer_addr, sent);
                return Err(HolePunchError::Timeout(peer_addr));
            }

            if now >= next_send && sent < self.config.max_attempts {
                socket.send_to(&probe, peer_addr).await?;
                sent += 1;
                next_send = now + interval;
                interval = (interval * 2).min(self.config.max_interval);
            }

            let wake = if sent < self.config.max_attempts {
                next_send.min(deadline)
            } else {
                deadline
            };

            match tokio::time::timeout_at(wake, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => {
                    let Some((kind, sender)) = decode_packet(&buf[..len]) else {
                        continue;
                    };
                    if &sender != peer_id {
                        continue;
                    }
                    if kind == PunchKind::Punch {
                        // let the peer finish too
                        socket.send_to(&ack, from).await?;
                    }
                    info!(
                        "Hole punch to {} succeeded via {} after {:?}",
                        peer_id.short(),
                        from,
                        start.elapsed()
                    );
                    return Ok(from);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => continue,
            }
        }
    }
}

/// Rendezvous and session setup for hole-punched connections
pub struct PunchCoordinator {
    transport: P2PTransport,
    stun: StunClient,
    config: HolePunchConfig,
    bind_addr: String,
    /// Our open requests, answered by the target's reply
    pending: Mutex<HashMap<NodeId, oneshot::Sender<SocketAddr>>>,
    /// Requests we are answering; duplicates via other relays are dropped
    answering: Mutex<HashSet<NodeId>>,
}

impl PunchCoordinator {
    pub fn new(transport: P2PTransport, stun: StunClient, config: HolePunchConfig) -> Self {
        Self {
            transport,
            stun,
            config,
            bind_addr: "0.0.0.0".to_string(),
            pending: Mutex::new(HashMap::new()),
            answering: Mutex::new(HashSet::new()),
        }
    }

    /// Local address punch sockets bind to
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// Reach `target` through a hole punch, asking connected peers to pass
    /// our mapping on. Fails within the punch deadline (plus STUN time) so
    /// the caller can fall back to the hub.
    pub async fn connect(&self, target: NodeId) -> Result<PeerInfo> {
        let relays: Vec<ConnectionId> = self
            .transport
            .authenticated_peers()
            .into_iter()
            .filter(|p| p.node_id != Some(target) && p.kind != ConnectionKind::Udp)
            .take(RENDEZVOUS_FANOUT)
            .map(|p| p.conn_id)
            .collect();
        if relays.is_empty() {
            return Err(HolePunchError::NoRendezvous);
        }

        let (socket, endpoint) = self.bind_mapped().await?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(target, tx);
        for via in relays {
            if let Err(e) = self
                .transport
                .send_punch_request(via, target, endpoint.to_string(), false)
                .await
            {
                debug!("Punch request via {} failed: {}", via, e);
            }
        }

        let peer_endpoint = match tokio::time::timeout(self.config.deadline, rx).await {
            Ok(Ok(addr)) => addr,
            _ => {
                self.pending.lock().remove(&target);
                return Err(HolePunchError::NoAnswer(target.short()));
            }
        };

        let puncher = HolePuncher::new(self.transport.identity().node_id, self.config.clone());
        let seen = puncher.punch(&socket, peer_endpoint, &target).await?;
        Ok(self.transport.connect_udp(socket, seen).await?)
    }

    /// React to [`TransportEvent::PunchRequested`](crate::TransportEvent)
    pub async fn handle_request(
        &self,
        via: ConnectionId,
        from: NodeId,
        endpoint: &str,
        reply: bool,
    ) -> Result<()> {
        let peer_endpoint: SocketAddr = endpoint
            .parse()
            .map_err(|_| HolePunchError::BadEndpoint(endpoint.to_string()))?;

        if reply {
            match self.pending.lock().remove(&from) {
                Some(tx) => {
                    let _ = tx.send(peer_endpoint);
                }
                None => debug!("Unexpected punch reply from {}", from.short()),
            }
            return Ok(());
        }

        if !self.answering.lock().insert(from) {
            return Ok(());
        }
        let result = self.answer(via, from, peer_endpoint).await;
        self.answering.lock().remove(&from);
        result
    }

    async fn answer(&self, via: ConnectionId, from: NodeId, peer_endpoint: SocketAddr) -> Result<()> {
        let (socket, own) = self.bind_mapped().await?;
        self.transport
            .send_punch_request(via, from, own.to_string(), true)
            .await?;
        let puncher = HolePuncher::new(self.transport.identity().node_id, self.config.clone());
        let seen = puncher.punch(&socket, peer_endpoint, &from).await?;
        self.transport.accept_udp(socket, seen).await?;
        Ok(())
    }

    /// Fresh socket plus its public mapping
    async fn bind_mapped(&self) -> Result<(UdpSocket, SocketAddr)> {
        let socket = UdpSocket::bind(format!("{}:0", self.bind_addr)).await?;
        let mapping = self.stun.discover_public_address(Some(&socket)).await?;
        Ok((socket, SocketAddr::V4(mapping.public_addr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::Dht;
    use crate::protocol::ProtocolMessage;
    use crate::stun::build_binding_response;
    use crate::transport::{TransportConfig, TransportEvent};
    use mumblechat_core::now_millis;
    use mumblechat_crypto::{sign_envelope, NodeIdentity};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn id(b: u8) -> NodeId {
        NodeId::from_bytes([b; 32])
    }

    #[test]
    fn test_packet_roundtrip() {
        let pkt = encode_packet(PunchKind::Ack, &id(3));
        assert_eq!(decode_packet(&pkt), Some((PunchKind::Ack, id(3))));
        assert_eq!(decode_packet(b"garbage"), None);
    }

    #[tokio::test]
    async fn test_two_sides_meet() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        let pa = HolePuncher::new(id(1), HolePunchConfig::default());
        let pb = HolePuncher::new(id(2), HolePunchConfig::default());

        let (id1, id2) = (id(1), id(2));
        let (ra, rb) = tokio::join!(pa.punch(&a, b_addr, &id2), pb.punch(&b, a_addr, &id1));
        assert_eq!(ra.unwrap(), b_addr);
        assert_eq!(rb.unwrap(), a_addr);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = HolePunchConfig {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(20),
            max_attempts: 3,
            deadline: Duration::from_millis(150),
        };
        let p = HolePuncher::new(id(1), config);
        let err = p
            .punch(&a, silent.local_addr().unwrap(), &id(2))
            .await
            .unwrap_err();
        assert!(matches!(err, HolePunchError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_ignores_wrong_peer_id() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = HolePunchConfig {
            deadline: Duration::from_millis(300),
            ..Default::default()
        };
        let pa = HolePuncher::new(id(1), config.clone());
        // b claims to be id(9) while a expects id(2)
        let pb = HolePuncher::new(id(9), config);

        let (id1, id2) = (id(1), id(2));
        let (ra, _) = tokio::join!(
            pa.punch(&a, b.local_addr().unwrap(), &id2),
            pb.punch(&b, a.local_addr().unwrap(), &id1)
        );
        assert!(matches!(ra, Err(HolePunchError::Timeout(_))));
    }

    /// STUN responder reflecting the sender's address
    async fn spawn_stun() -> SocketAddr {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, from)) = server.recv_from(&mut buf).await {
                if len < 20 {
                    continue;
                }
                let mut txid = [0u8; 12];
                txid.copy_from_slice(&buf[8..20]);
                let SocketAddr::V4(from_v4) = from else { continue };
                let _ = server.send_to(&build_binding_response(&txid, from_v4), from).await;
            }
        });
        addr
    }

    async fn start_node() -> (P2PTransport, mpsc::Receiver<TransportEvent>) {
        let identity = NodeIdentity::generate();
        let dht = Arc::new(Dht::new(identity.node_id));
        let config = TransportConfig {
            bind_addr: "127.0.0.1".to_string(),
            tcp_port: 0,
            ws_port: None,
            maintenance_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        P2PTransport::start(config, identity, dht).await.unwrap()
    }

    /// Hand punch events to the coordinator; forward everything else
    fn pump(
        coordinator: Arc<PunchCoordinator>,
        mut rx: mpsc::Receiver<TransportEvent>,
    ) -> mpsc::Receiver<TransportEvent> {
        let (tx, out) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                match ev {
                    TransportEvent::PunchRequested { conn_id, from, endpoint, reply } => {
                        let c = coordinator.clone();
                        tokio::spawn(async move {
                            let _ = c.handle_request(conn_id, from, &endpoint, reply).await;
                        });
                    }
                    other => {
                        let _ = tx.send(other).await;
                    }
                }
            }
        });
        out
    }

    async fn wait_udp_peer(rx: &mut mpsc::Receiver<TransportEvent>) -> PeerInfo {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Some(TransportEvent::PeerAuthenticated(info)) if info.kind == ConnectionKind::Udp => {
                        return info
                    }
                    Some(_) => continue,
                    None => panic!("transport closed"),
                }
            }
        })
        .await
        .expect("no UDP session")
    }

    #[tokio::test]
    async fn test_rendezvous_punch_opens_udp_session() {
        let stun = StunClient::with_servers(vec![spawn_stun().await.to_string()]);
        let (rendezvous, _r_rx) = start_node().await;
        let (a, a_rx) = start_node().await;
        let (b, b_rx) = start_node().await;

        let config = HolePunchConfig {
            deadline: Duration::from_secs(5),
            ..Default::default()
        };
        let ca = Arc::new(
            PunchCoordinator::new(a.clone(), stun.clone(), config.clone()).with_bind_addr("127.0.0.1"),
        );
        let cb = Arc::new(PunchCoordinator::new(b.clone(), stun, config).with_bind_addr("127.0.0.1"));
        let mut a_rx = pump(ca.clone(), a_rx);
        let mut b_rx = pump(cb, b_rx);

        a.connect(&rendezvous.local_addr().to_string()).await.unwrap();
        b.connect(&rendezvous.local_addr().to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let info = ca.connect(b.identity().node_id).await.unwrap();
        assert_eq!(info.kind, ConnectionKind::Udp);
        assert_eq!(info.node_id, Some(b.identity().node_id));

        let seen = wait_udp_peer(&mut b_rx).await;
        assert_eq!(seen.node_id, Some(a.identity().node_id));
        let _ = wait_udp_peer(&mut a_rx).await;

        // the newest session owns the wallet route
        let b_wallet = b.identity().wallet_address.clone();
        let env = sign_envelope(a.identity(), "punched-1", &b_wallet, vec![1, 2], now_millis());
        a.send_to_wallet(&b_wallet, &ProtocolMessage::Message(env.clone()))
            .await
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(TransportEvent::Message { envelope, .. }) = b_rx.recv().await {
                    return envelope;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(got, env);
    }

    #[tokio::test]
    async fn test_connect_without_rendezvous_fails_fast() {
        let stun = StunClient::with_servers(vec![spawn_stun().await.to_string()]);
        let (a, _a_rx) = start_node().await;
        let ca = PunchCoordinator::new(a, stun, HolePunchConfig::default());
        let err = ca.connect(NodeId::from_bytes([3u8; 32])).await.unwrap_err();
        assert!(matches!(err, HolePunchError::NoRendezvous));
    }

    #[tokio::test]
    async fn test_unanswered_request_gives_up() {
        let stun = StunClient::with_servers(vec![spawn_stun().await.to_string()]);
        let (rendezvous, _r_rx) = start_node().await;
        let (a, _a_rx) = start_node().await;
        a.connect(&rendezvous.local_addr().to_string()).await.unwrap();

        let config = HolePunchConfig {
            deadline: Duration::from_millis(300),
            ..Default::default()
        };
        let ca = PunchCoordinator::new(a, stun, config).with_bind_addr("127.0.0.1");
        // nobody with this id is connected to the rendezvous
        let err = ca.connect(NodeId::from_bytes([3u8; 32])).await.unwrap_err();
        assert!(matches!(err, HolePunchError::NoAnswer(_)));
    }
}
