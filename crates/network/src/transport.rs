//! P2P transport
//!
//! Owns every peer connection (TCP, WebSocket and hole-punched UDP). Each
//! connection gets a
//! reader task that decodes frames and handles them in arrival order, and a
//! writer task fed by a bounded queue. Application-facing traffic leaves the
//! transport as [`TransportEvent`]s on a single channel.
//!
//! Connection states: `Connected (unauthenticated) -> Authenticated -> Closed`.
//! Only HANDSHAKE, HANDSHAKE_ACK, PING and PONG are processed before the
//! signed handshake has been verified; anything else is dropped with a warning
//! and the connection stays open.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use mumblechat_core::{now_millis, MessageEnvelope, NodeId, RelayRequest};
use mumblechat_crypto::{is_key_hash, key_hash, node_id_from_wallet, verify_envelope, NodeIdentity};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::codec::{Frame, FrameDecoder};
use crate::dedup::MessageIdCache;
use crate::dht::{Dht, K};
use crate::error::{NetworkError, Result};
use crate::protocol::{
    FindNode, HandshakeAck, HandshakePayload, PeerExchange, PeerRecord, PingPayload,
    ProtocolMessage, PunchRequest, RelayResponse,
};

/// Outbound frames queued per connection before senders wait
const OUTBOUND_QUEUE: usize = 256;

/// Socket read buffer
const READ_BUF_SIZE: usize = 16 * 1024;

/// Persisted-mode relay acks give up after this long
const RELAY_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Peers queried per stale bucket during DHT refresh
const REFRESH_FANOUT: usize = 3;

/// Largest frame carried in one UDP datagram
pub const MAX_DATAGRAM: usize = 65_507;

/// Handshake resend interval on UDP sessions
const UDP_HANDSHAKE_RESEND: Duration = Duration::from_millis(500);

/// How RELAY_REQUEST is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayAckMode {
    /// RELAY_RESPONSE is sent immediately with `stored=false`
    #[default]
    Accepted,
    /// RELAY_RESPONSE waits for the application to confirm storage
    Persisted,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub bind_addr: String,
    /// TCP port; 0 picks an ephemeral port
    pub tcp_port: u16,
    /// WebSocket port; `None` disables the WebSocket listener
    pub ws_port: Option<u16>,
    pub max_connections: usize,
    pub ping_interval: Duration,
    pub peer_timeout: Duration,
    pub maintenance_interval: Duration,
    /// Unauthenticated connections are closed after this long
    pub handshake_timeout: Duration,
    pub dedup_ttl: Duration,
    pub ack_mode: RelayAckMode,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            tcp_port: 19370,
            ws_port: Some(19371),
            max_connections: 200,
            ping_interval: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(120),
            maintenance_interval: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(30),
            dedup_ttl: Duration::from_secs(600),
            ack_mode: RelayAckMode::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Tcp,
    WebSocket,
    /// One frame per datagram over a hole-punched binding
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Snapshot of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub conn_id: ConnectionId,
    pub node_id: Option<NodeId>,
    pub wallet_address: Option<String>,
    pub remote_addr: SocketAddr,
    /// `ip:port` the peer accepts connections on, if it told us
    pub listen_addr: Option<String>,
    pub kind: ConnectionKind,
    pub direction: Direction,
    pub authenticated: bool,
    pub last_seen_ms: u64,
}

/// Events delivered to the application, in per-connection arrival order
#[derive(Debug)]
pub enum TransportEvent {
    PeerAuthenticated(PeerInfo),
    PeerDisconnected {
        conn_id: ConnectionId,
        wallet_address: Option<String>,
        node_id: Option<NodeId>,
    },
    /// A deduplicated chat message
    Message {
        conn_id: ConnectionId,
        from_wallet: String,
        envelope: MessageEnvelope,
    },
    /// Store-and-forward request; `sender_key_hash` is already filled in.
    /// In persisted ack mode `ack` must be answered.
    RelayRequest {
        conn_id: ConnectionId,
        from_wallet: String,
        request: RelayRequest,
        ack: Option<oneshot::Sender<RelayResponse>>,
    },
    RelayResponse {
        conn_id: ConnectionId,
        from_wallet: String,
        response: RelayResponse,
    },
    SyncRequest {
        conn_id: ConnectionId,
        wallet_address: String,
        since: Option<u64>,
    },
    PeersDiscovered {
        from: NodeId,
        peers: Vec<PeerRecord>,
    },
    /// A peer wants to hole punch with us, or answered our request.
    /// `endpoint` is its public UDP mapping.
    PunchRequested {
        conn_id: ConnectionId,
        from: NodeId,
        endpoint: String,
        reply: bool,
    },
}

/// What a frame handler needs to know about the sending connection
struct FrameSource {
    authenticated: bool,
    wallet: Option<String>,
    node_id: Option<NodeId>,
    public_key: Option<[u8; 32]>,
    kind: ConnectionKind,
}

struct Connection {
    info: PeerInfo,
    public_key: Option<[u8; 32]>,
    tx: mpsc::Sender<Bytes>,
    opened_at: Instant,
    last_seen: Instant,
    last_ping: Option<Instant>,
    /// FIND_NODE / peer requests sent and not yet answered
    outstanding_queries: u32,
    reader: Option<AbortHandle>,
}

type AuthWaiter = oneshot::Sender<std::result::Result<PeerInfo, String>>;

struct Inner {
    config: TransportConfig,
    identity: NodeIdentity,
    dht: Arc<Dht>,
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    wallets: RwLock<HashMap<String, ConnectionId>>,
    auth_waiters: Mutex<HashMap<ConnectionId, AuthWaiter>>,
    dedup: Mutex<MessageIdCache>,
    events: mpsc::Sender<TransportEvent>,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    tcp_addr: SocketAddr,
    ws_addr: Option<SocketAddr>,
}

/// Handle to a running transport; cheap to clone
#[derive(Clone)]
pub struct P2PTransport {
    inner: Arc<Inner>,
}

impl P2PTransport {
    /// Bind listeners and start the accept and maintenance loops.
    ///
    /// A bind failure is fatal for the node and is returned as
    /// [`NetworkError::Bind`].
    pub async fn start(
        config: TransportConfig,
        identity: NodeIdentity,
        dht: Arc<Dht>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let tcp_bind = format!("{}:{}", config.bind_addr, config.tcp_port);
        let tcp_listener = TcpListener::bind(&tcp_bind)
            .await
            .map_err(|source| NetworkError::Bind {
                addr: tcp_bind.clone(),
                source,
            })?;
        let tcp_addr = tcp_listener.local_addr()?;

        let ws_listener = match config.ws_port {
            Some(port) => {
                let ws_bind = format!("{}:{}", config.bind_addr, port);
                let listener = TcpListener::bind(&ws_bind)
                    .await
                    .map_err(|source| NetworkError::Bind {
                        addr: ws_bind.clone(),
                        source,
                    })?;
                Some(listener)
            }
            None => None,
        };
        let ws_addr = match &ws_listener {
            Some(l) => Some(l.local_addr()?),
            None => None,
        };

        let (events_tx, events_rx) = mpsc::channel(1024);
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            dedup: Mutex::new(MessageIdCache::with_config(config.dedup_ttl, 50_000)),
            config,
            identity,
            dht,
            connections: RwLock::new(HashMap::new()),
            wallets: RwLock::new(HashMap::new()),
            auth_waiters: Mutex::new(HashMap::new()),
            events: events_tx,
            next_id: AtomicU64::new(1),
            shutdown: shutdown_tx,
            closed: AtomicBool::new(false),
            tcp_addr,
            ws_addr,
        });

        info!(
            "P2P transport listening on tcp {} ws {:?} as {}",
            tcp_addr,
            ws_addr,
            inner.identity.wallet_address
        );

        tokio::spawn(inner.clone().tcp_accept_loop(tcp_listener));
        if let Some(listener) = ws_listener {
            tokio::spawn(inner.clone().ws_accept_loop(listener));
        }
        tokio::spawn(inner.clone().maintenance_loop());

        Ok((Self { inner }, events_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.tcp_addr
    }

    pub fn ws_local_addr(&self) -> Option<SocketAddr> {
        self.inner.ws_addr
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.inner.identity
    }

    pub fn dht(&self) -> &Arc<Dht> {
        &self.inner.dht
    }

    /// Dial `addr` and wait for the handshake to complete. A `ws://` URL is
    /// dialled over WebSocket, anything else as `host:port` over TCP.
    pub async fn connect(&self, addr: &str) -> Result<PeerInfo> {
        if addr.starts_with("ws://") {
            return self.connect_ws(addr).await;
        }
        self.inner.ensure_open()?;
        let stream = tokio::time::timeout(
            self.inner.config.handshake_timeout,
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| NetworkError::HandshakeTimeout)??;
        let remote = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);

        let (id, rx) = self.inner.register(remote, ConnectionKind::Tcp, Direction::Outbound)?;
        let waiter = self.inner.add_waiter(id);
        self.inner.spawn_tcp(id, stream, rx);
        self.inner.finish_dial(id, waiter).await
    }

    async fn connect_ws(&self, url: &str) -> Result<PeerInfo> {
        self.inner.ensure_open()?;
        let host = url
            .strip_prefix("ws://")
            .and_then(|rest| rest.split('/').next())
            .ok_or_else(|| NetworkError::WebSocket(format!("unsupported url {}", url)))?;

        let timeout = self.inner.config.handshake_timeout;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(host))
            .await
            .map_err(|_| NetworkError::HandshakeTimeout)??;
        let remote = stream.peer_addr()?;
        let (ws, _) = tokio::time::timeout(timeout, tokio_tungstenite::client_async(url, stream))
            .await
            .map_err(|_| NetworkError::HandshakeTimeout)??;

        let (id, rx) = self
            .inner
            .register(remote, ConnectionKind::WebSocket, Direction::Outbound)?;
        let waiter = self.inner.add_waiter(id);
        self.inner.spawn_ws(id, ws, rx);
        self.inner.finish_dial(id, waiter).await
    }

    /// Run a session over a hole-punched UDP binding and handshake as the
    /// dialing side. `socket` must be the one the punch was made from.
    pub async fn connect_udp(&self, socket: UdpSocket, peer: SocketAddr) -> Result<PeerInfo> {
        self.inner.ensure_open()?;
        socket.connect(peer).await?;
        let (id, rx) = self.inner.register(peer, ConnectionKind::Udp, Direction::Outbound)?;
        let waiter = self.inner.add_waiter(id);
        self.inner.spawn_udp(id, Arc::new(socket), rx);
        self.inner.finish_dial(id, waiter).await
    }

    /// Run a session over a hole-punched UDP binding and wait for the
    /// remote side's handshake
    pub async fn accept_udp(&self, socket: UdpSocket, peer: SocketAddr) -> Result<ConnectionId> {
        self.inner.ensure_open()?;
        socket.connect(peer).await?;
        let (id, rx) = self.inner.register(peer, ConnectionKind::Udp, Direction::Inbound)?;
        self.inner.spawn_udp(id, Arc::new(socket), rx);
        Ok(id)
    }

    /// Queue a message on a specific connection
    pub async fn send(&self, conn_id: ConnectionId, msg: &ProtocolMessage) -> Result<()> {
        self.inner.send(conn_id, msg).await
    }

    /// Queue a message to the authenticated peer owning `wallet`
    pub async fn send_to_wallet(&self, wallet: &str, msg: &ProtocolMessage) -> Result<()> {
        let id = self
            .inner
            .conn_for_wallet(wallet)
            .ok_or_else(|| NetworkError::PeerNotConnected(wallet.to_string()))?;
        self.inner.send(id, msg).await
    }

    pub fn is_connected(&self, wallet: &str) -> bool {
        self.inner.conn_for_wallet(wallet).is_some()
    }

    /// All connections, authenticated or not
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner
            .connections
            .read()
            .values()
            .map(|c| c.info.clone())
            .collect()
    }

    pub fn authenticated_peers(&self) -> Vec<PeerInfo> {
        self.peers().into_iter().filter(|p| p.authenticated).collect()
    }

    /// Record a message id; false if it was already seen. Shared by every
    /// path a message can arrive on.
    pub fn first_sighting(&self, message_id: &str) -> bool {
        self.inner.dedup.lock().check_and_insert(message_id)
    }

    /// Ask a peer for contacts close to `target`
    pub async fn send_find_node(&self, conn_id: ConnectionId, target: NodeId) -> Result<()> {
        self.inner
            .send_query(conn_id, &ProtocolMessage::FindNode(FindNode { target }))
            .await
    }

    /// Ask `via` to pass our punch endpoint on to `target`
    pub async fn send_punch_request(
        &self,
        via: ConnectionId,
        target: NodeId,
        endpoint: String,
        reply: bool,
    ) -> Result<()> {
        let msg = ProtocolMessage::PunchRequest(PunchRequest {
            target,
            origin: None,
            endpoint,
            reply,
        });
        self.inner.send(via, &msg).await
    }

    /// Closest known contacts from the local routing table
    pub fn find_node(&self, target: &NodeId, count: usize) -> Vec<PeerRecord> {
        self.inner.dht.find_node(target, count)
    }

    pub async fn disconnect(&self, conn_id: ConnectionId) {
        self.inner.disconnect(conn_id, "requested").await;
    }

    /// Stop listeners and close every connection
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown.send(true);
        let drained: Vec<Connection> = {
            let mut conns = self.inner.connections.write();
            conns.drain().map(|(_, c)| c).collect()
        };
        self.inner.wallets.write().clear();
        self.inner.auth_waiters.lock().clear();
        let count = drained.len();
        for conn in drained {
            if let Some(reader) = conn.reader {
                reader.abort();
            }
            // dropping `tx` lets the writer flush and close
        }
        info!("P2P transport shut down ({} connections closed)", count);
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(NetworkError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn has_capacity(&self) -> bool {
        self.connections.read().len() < self.config.max_connections
    }

    fn register(
        &self,
        remote: SocketAddr,
        kind: ConnectionKind,
        direction: Direction,
    ) -> Result<(ConnectionId, mpsc::Receiver<Bytes>)> {
        let mut conns = self.connections.write();
        if conns.len() >= self.config.max_connections {
            return Err(NetworkError::ConnectionLimit);
        }
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let now = Instant::now();
        conns.insert(
            id,
            Connection {
                info: PeerInfo {
                    conn_id: id,
                    node_id: None,
                    wallet_address: None,
                    remote_addr: remote,
                    listen_addr: None,
                    kind,
                    direction,
                    authenticated: false,
                    last_seen_ms: now_millis(),
                },
                public_key: None,
                tx,
                opened_at: now,
                last_seen: now,
                last_ping: None,
                outstanding_queries: 0,
                reader: None,
            },
        );
        debug!("{} registered {:?} {:?} from {}", id, kind, direction, remote);
        Ok((id, rx))
    }

    fn set_reader(&self, id: ConnectionId, handle: AbortHandle) {
        if let Some(conn) = self.connections.write().get_mut(&id) {
            conn.reader = Some(handle);
        }
    }

    fn add_waiter(&self, id: ConnectionId) -> oneshot::Receiver<std::result::Result<PeerInfo, String>> {
        let (tx, rx) = oneshot::channel();
        self.auth_waiters.lock().insert(id, tx);
        rx
    }

    async fn finish_dial(
        self: &Arc<Self>,
        id: ConnectionId,
        waiter: oneshot::Receiver<std::result::Result<PeerInfo, String>>,
    ) -> Result<PeerInfo> {
        let msg = ProtocolMessage::Handshake(self.own_handshake());
        if let Err(e) = self.send(id, &msg).await {
            self.disconnect(id, "handshake send failed").await;
            return Err(e);
        }
        let is_udp = self
            .connections
            .read()
            .get(&id)
            .map(|c| c.info.kind == ConnectionKind::Udp)
            .unwrap_or(false);
        // datagrams can be lost; keep offering the handshake until answered
        let resend = is_udp.then(|| tokio::spawn(self.clone().resend_handshake(id)));

        let outcome = tokio::time::timeout(self.config.handshake_timeout, waiter).await;
        if let Some(task) = resend {
            task.abort();
        }
        match outcome {
            Ok(Ok(Ok(info))) => Ok(info),
            Ok(Ok(Err(reason))) => {
                self.disconnect(id, "handshake rejected").await;
                Err(NetworkError::HandshakeRejected(reason))
            }
            Ok(Err(_)) => Err(NetworkError::HandshakeRejected("connection closed".to_string())),
            Err(_) => {
                self.disconnect(id, "handshake timeout").await;
                Err(NetworkError::HandshakeTimeout)
            }
        }
    }

    async fn resend_handshake(self: Arc<Self>, id: ConnectionId) {
        loop {
            tokio::time::sleep(UDP_HANDSHAKE_RESEND).await;
            let pending = self
                .connections
                .read()
                .get(&id)
                .map(|c| !c.info.authenticated)
                .unwrap_or(false);
            if !pending {
                return;
            }
            let msg = ProtocolMessage::Handshake(self.own_handshake());
            if self.send(id, &msg).await.is_err() {
                return;
            }
        }
    }

    fn conn_for_wallet(&self, wallet: &str) -> Option<ConnectionId> {
        self.wallets.read().get(&wallet.to_lowercase()).copied()
    }

    fn conn_for_node(&self, node_id: &NodeId) -> Option<ConnectionId> {
        self.connections
            .read()
            .values()
            .find(|c| c.info.authenticated && c.info.node_id.as_ref() == Some(node_id))
            .map(|c| c.info.conn_id)
    }

    fn sender(&self, id: ConnectionId) -> Option<mpsc::Sender<Bytes>> {
        self.connections.read().get(&id).map(|c| c.tx.clone())
    }

    async fn send(&self, id: ConnectionId, msg: &ProtocolMessage) -> Result<()> {
        let bytes = msg.encode()?;
        let tx = self
            .sender(id)
            .ok_or_else(|| NetworkError::PeerNotConnected(id.to_string()))?;
        tx.send(bytes)
            .await
            .map_err(|_| NetworkError::PeerNotConnected(id.to_string()))
    }

    /// Send a request whose PEER_EXCHANGE answer we will accept
    async fn send_query(&self, id: ConnectionId, msg: &ProtocolMessage) -> Result<()> {
        if let Some(conn) = self.connections.write().get_mut(&id) {
            conn.outstanding_queries = conn.outstanding_queries.saturating_add(1);
        }
        self.send(id, msg).await
    }

    /// Consume one outstanding query on `id`; false for unsolicited answers
    fn take_query(&self, id: ConnectionId) -> bool {
        match self.connections.write().get_mut(&id) {
            Some(conn) if conn.outstanding_queries > 0 => {
                conn.outstanding_queries -= 1;
                true
            }
            _ => false,
        }
    }

    async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Transport event dropped: receiver gone");
        }
    }

    fn own_handshake(&self) -> HandshakePayload {
        HandshakePayload::signed(&self.identity, now_millis(), Some(self.tcp_addr.port()))
    }

    /// Remove a connection, stop its reader and notify the application
    async fn disconnect(&self, id: ConnectionId, reason: &str) {
        let removed = self.connections.write().remove(&id);
        let Some(conn) = removed else {
            return;
        };
        if let Some(reader) = &conn.reader {
            reader.abort();
        }
        self.finish_close(conn, reason).await;
    }

    /// Called by a reader that has already stopped
    async fn reader_finished(&self, id: ConnectionId, reason: &str) {
        let removed = self.connections.write().remove(&id);
        if let Some(conn) = removed {
            self.finish_close(conn, reason).await;
        }
    }

    async fn finish_close(&self, conn: Connection, reason: &str) {
        let id = conn.info.conn_id;
        if let Some(waiter) = self.auth_waiters.lock().remove(&id) {
            let _ = waiter.send(Err(format!("connection closed: {}", reason)));
        }
        if let Some(wallet) = &conn.info.wallet_address {
            let mut wallets = self.wallets.write();
            if wallets.get(wallet) == Some(&id) {
                wallets.remove(wallet);
            }
        }
        if let Some(node_id) = &conn.info.node_id {
            self.dht.forget_peer(node_id);
        }
        debug!("{} closed: {}", id, reason);

        if conn.info.authenticated {
            self.emit(TransportEvent::PeerDisconnected {
                conn_id: id,
                wallet_address: conn.info.wallet_address.clone(),
                node_id: conn.info.node_id,
            })
            .await;
        }
    }

    fn spawn_tcp(self: &Arc<Self>, id: ConnectionId, stream: TcpStream, rx: mpsc::Receiver<Bytes>) {
        let (read_half, write_half) = stream.into_split();
        tokio::spawn(tcp_writer(write_half, rx));

        let inner = self.clone();
        let handle = tokio::spawn(async move {
            let reason = inner.tcp_read_loop(id, read_half).await;
            inner.reader_finished(id, reason).await;
        });
        self.set_reader(id, handle.abort_handle());
    }

    fn spawn_ws<S>(self: &Arc<Self>, id: ConnectionId, ws: WebSocketStream<S>, rx: mpsc::Receiver<Bytes>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        tokio::spawn(ws_writer(sink, rx));

        let inner = self.clone();
        let handle = tokio::spawn(async move {
            let reason = inner.ws_read_loop(id, stream).await;
            inner.reader_finished(id, reason).await;
        });
        self.set_reader(id, handle.abort_handle());
    }

    fn spawn_udp(self: &Arc<Self>, id: ConnectionId, socket: Arc<UdpSocket>, rx: mpsc::Receiver<Bytes>) {
        tokio::spawn(udp_writer(socket.clone(), rx));

        let inner = self.clone();
        let handle = tokio::spawn(async move {
            let reason = inner.udp_read_loop(id, socket).await;
            inner.reader_finished(id, reason).await;
        });
        self.set_reader(id, handle.abort_handle());
    }

    async fn tcp_read_loop(self: &Arc<Self>, id: ConnectionId, mut half: OwnedReadHalf) -> &'static str {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let n = match half.read(&mut buf).await {
                Ok(0) => return "eof",
                Ok(n) => n,
                Err(e) => {
                    debug!("{} read error: {}", id, e);
                    return "read error";
                }
            };
            if !self.on_bytes(id, &mut decoder, &buf[..n]).await {
                return "protocol error";
            }
        }
    }

    async fn ws_read_loop<S>(
        self: &Arc<Self>,
        id: ConnectionId,
        mut stream: futures::stream::SplitStream<WebSocketStream<S>>,
    ) -> &'static str
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut decoder = FrameDecoder::new();
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(WsMessage::Binary(data)) => {
                    if !self.on_bytes(id, &mut decoder, &data).await {
                        return "protocol error";
                    }
                }
                Ok(WsMessage::Close(_)) => return "ws close",
                Ok(_) => {}
                Err(e) => {
                    debug!("{} websocket error: {}", id, e);
                    return "ws error";
                }
            }
        }
        "eof"
    }

    /// Each datagram holds exactly one frame. Anything else (late punch
    /// probes included) is skipped without closing the session.
    async fn udp_read_loop(self: &Arc<Self>, id: ConnectionId, socket: Arc<UdpSocket>) -> &'static str {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let n = match socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    debug!("{} datagram error: {}", id, e);
                    return "read error";
                }
            };
            let mut decoder = FrameDecoder::new();
            decoder.push(&buf[..n]);
            match decoder.next_frame() {
                Ok(Some(frame)) if decoder.buffered() == 0 => {
                    if !self.handle_frame(id, frame).await {
                        return "protocol error";
                    }
                }
                _ => debug!("{} ignoring {}-byte datagram", id, n),
            }
        }
    }

    /// Feed a chunk; false means the connection must close
    async fn on_bytes(self: &Arc<Self>, id: ConnectionId, decoder: &mut FrameDecoder, chunk: &[u8]) -> bool {
        decoder.push(chunk);
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if !self.handle_frame(id, frame).await {
                        return false;
                    }
                }
                Ok(None) => return true,
                Err(e) => {
                    warn!("{} stream error, closing: {}", id, e);
                    return false;
                }
            }
        }
    }

    fn touch(&self, id: ConnectionId) -> Option<FrameSource> {
        let mut conns = self.connections.write();
        let conn = conns.get_mut(&id)?;
        conn.last_seen = Instant::now();
        conn.info.last_seen_ms = now_millis();
        Some(FrameSource {
            authenticated: conn.info.authenticated,
            wallet: conn.info.wallet_address.clone(),
            node_id: conn.info.node_id,
            public_key: conn.public_key,
            kind: conn.info.kind,
        })
    }

    async fn handle_frame(self: &Arc<Self>, id: ConnectionId, frame: Frame) -> bool {
        let Some(FrameSource {
            authenticated,
            wallet,
            node_id,
            public_key: peer_key,
            kind,
        }) = self.touch(id)
        else {
            return false;
        };

        let frame_type = match frame.frame_type() {
            Ok(t) => t,
            Err(e) => {
                warn!("{} dropping frame: {}", id, e);
                return true;
            }
        };
        if !authenticated && !frame_type.allowed_before_auth() {
            warn!("{} dropping {:?} from unauthenticated peer", id, frame_type);
            return true;
        }

        let msg = match ProtocolMessage::from_frame(&frame) {
            Ok(m) => m,
            Err(e) => {
                warn!("{} dropping frame: {}", id, e);
                return true;
            }
        };

        match msg {
            ProtocolMessage::Handshake(claim) => {
                if authenticated {
                    // our ack may have been lost in transit
                    if kind == ConnectionKind::Udp {
                        let ack = ProtocolMessage::HandshakeAck(HandshakeAck {
                            accepted: true,
                            reason: None,
                            handshake: Some(self.own_handshake()),
                        });
                        let _ = self.send(id, &ack).await;
                    }
                    return true;
                }
                self.on_handshake(id, claim).await
            }
            ProtocolMessage::HandshakeAck(ack) => {
                if authenticated {
                    return true;
                }
                self.on_handshake_ack(id, ack).await
            }
            ProtocolMessage::Ping(p) => {
                let _ = self.send(id, &ProtocolMessage::Pong(p)).await;
                true
            }
            ProtocolMessage::Pong(_) => true,
            // everything below requires authentication, checked above
            ProtocolMessage::Message(envelope) => {
                let from_wallet = wallet.unwrap_or_default();
                self.on_message(id, from_wallet, peer_key, envelope).await;
                true
            }
            ProtocolMessage::RelayRequest(request) => {
                self.on_relay_request(id, wallet.unwrap_or_default(), request).await;
                true
            }
            ProtocolMessage::RelayResponse(response) => {
                self.emit(TransportEvent::RelayResponse {
                    conn_id: id,
                    from_wallet: wallet.unwrap_or_default(),
                    response,
                })
                .await;
                true
            }
            ProtocolMessage::PeerExchange(px) => {
                if let Some(node_id) = node_id {
                    self.on_peer_exchange(id, node_id, px).await;
                }
                true
            }
            ProtocolMessage::FindNode(FindNode { target }) => {
                if let Some(node_id) = node_id {
                    self.answer_query(id, node_id, &target).await;
                }
                true
            }
            ProtocolMessage::SyncRequest(req) => {
                self.emit(TransportEvent::SyncRequest {
                    conn_id: id,
                    wallet_address: wallet.unwrap_or_default(),
                    since: req.since,
                })
                .await;
                true
            }
            ProtocolMessage::PunchRequest(req) => {
                if let Some(node_id) = node_id {
                    self.on_punch_request(id, node_id, req).await;
                }
                true
            }
        }
    }

    fn check_claim(&self, claim: &HandshakePayload) -> std::result::Result<[u8; 32], String> {
        let key = claim.verify(now_millis()).map_err(|e| e.to_string())?;
        if claim.wallet_address.eq_ignore_ascii_case(&self.identity.wallet_address) {
            return Err("self connection".to_string());
        }
        Ok(key)
    }

    async fn on_handshake(self: &Arc<Self>, id: ConnectionId, claim: HandshakePayload) -> bool {
        match self.check_claim(&claim) {
            Ok(key) => {
                let ack = ProtocolMessage::HandshakeAck(HandshakeAck {
                    accepted: true,
                    reason: None,
                    handshake: Some(self.own_handshake()),
                });
                if self.send(id, &ack).await.is_err() {
                    return false;
                }
                self.mark_authenticated(id, &claim, key).await;
                true
            }
            Err(reason) => {
                warn!("{} handshake rejected: {}", id, reason);
                let ack = ProtocolMessage::HandshakeAck(HandshakeAck {
                    accepted: false,
                    reason: Some(reason),
                    handshake: None,
                });
                let _ = self.send(id, &ack).await;
                false
            }
        }
    }

    async fn on_handshake_ack(self: &Arc<Self>, id: ConnectionId, ack: HandshakeAck) -> bool {
        let result = match (ack.accepted, ack.handshake) {
            (true, Some(claim)) => self.check_claim(&claim).map(|key| (claim, key)),
            (true, None) => Err("ack without identity".to_string()),
            (false, _) => Err(ack.reason.unwrap_or_else(|| "rejected".to_string())),
        };
        match result {
            Ok((claim, key)) => {
                self.mark_authenticated(id, &claim, key).await;
                true
            }
            Err(reason) => {
                warn!("{} handshake failed: {}", id, reason);
                if let Some(waiter) = self.auth_waiters.lock().remove(&id) {
                    let _ = waiter.send(Err(reason));
                }
                false
            }
        }
    }

    async fn mark_authenticated(&self, id: ConnectionId, claim: &HandshakePayload, key: [u8; 32]) {
        let wallet = claim.wallet_address.to_lowercase();
        let node_id = node_id_from_wallet(&wallet);

        let info = {
            let mut conns = self.connections.write();
            let Some(conn) = conns.get_mut(&id) else {
                return;
            };
            conn.info.authenticated = true;
            conn.info.wallet_address = Some(wallet.clone());
            conn.info.node_id = Some(node_id);
            // a punched peer's TCP port is not reachable at its NAT address
            if conn.info.kind != ConnectionKind::Udp {
                conn.info.listen_addr = claim
                    .listen_port
                    .map(|port| SocketAddr::new(conn.info.remote_addr.ip(), port).to_string());
            }
            conn.public_key = Some(key);
            conn.info.clone()
        };

        if let Some(previous) = self.wallets.write().insert(wallet.clone(), id) {
            if previous != id {
                debug!("{} replaces {} for {}", id, previous, wallet);
            }
        }

        if let Some(address) = &info.listen_addr {
            self.dht.store_peer(PeerRecord {
                node_id,
                wallet_address: wallet.clone(),
                address: address.clone(),
                last_seen: info.last_seen_ms,
            });
        }

        info!("{} authenticated as {} ({})", id, wallet, node_id.short());

        if let Some(waiter) = self.auth_waiters.lock().remove(&id) {
            let _ = waiter.send(Ok(info.clone()));
        }
        self.emit(TransportEvent::PeerAuthenticated(info)).await;
    }

    async fn on_message(
        &self,
        id: ConnectionId,
        from_wallet: String,
        peer_key: Option<[u8; 32]>,
        envelope: MessageEnvelope,
    ) {
        // direct messages can be checked against the handshake key; a forgery
        // must not claim the id before the genuine message arrives
        if envelope.sender_address.eq_ignore_ascii_case(&from_wallet) {
            let valid = peer_key
                .map(|key| verify_envelope(&envelope, &key))
                .unwrap_or(false);
            if !valid {
                warn!("{} bad signature on message {}", id, envelope.message_id);
                return;
            }
        }
        if !self.dedup.lock().check_and_insert(&envelope.message_id) {
            debug!("{} duplicate message {} dropped", id, envelope.message_id);
            return;
        }
        self.emit(TransportEvent::Message {
            conn_id: id,
            from_wallet,
            envelope,
        })
        .await;
    }

    async fn on_relay_request(self: &Arc<Self>, id: ConnectionId, from_wallet: String, mut request: RelayRequest) {
        if request.message_id.is_empty() || !is_key_hash(&request.recipient_key_hash) {
            let resp = RelayResponse {
                message_id: request.message_id.clone(),
                accepted: false,
                stored: false,
                reason: Some("invalid relay request".to_string()),
            };
            let _ = self.send(id, &ProtocolMessage::RelayResponse(resp)).await;
            return;
        }
        request.sender_key_hash = key_hash(&from_wallet);
        let message_id = request.message_id.clone();

        match self.config.ack_mode {
            RelayAckMode::Accepted => {
                let resp = RelayResponse {
                    message_id,
                    accepted: true,
                    stored: false,
                    reason: None,
                };
                let _ = self.send(id, &ProtocolMessage::RelayResponse(resp)).await;
                self.emit(TransportEvent::RelayRequest {
                    conn_id: id,
                    from_wallet,
                    request,
                    ack: None,
                })
                .await;
            }
            RelayAckMode::Persisted => {
                let (tx, rx) = oneshot::channel();
                self.emit(TransportEvent::RelayRequest {
                    conn_id: id,
                    from_wallet,
                    request,
                    ack: Some(tx),
                })
                .await;
                let inner = self.clone();
                tokio::spawn(async move {
                    let resp = match tokio::time::timeout(RELAY_ACK_TIMEOUT, rx).await {
                        Ok(Ok(resp)) => resp,
                        _ => RelayResponse {
                            message_id,
                            accepted: false,
                            stored: false,
                            reason: Some("storage unavailable".to_string()),
                        },
                    };
                    let _ = inner.send(id, &ProtocolMessage::RelayResponse(resp)).await;
                });
            }
        }
    }

    async fn on_peer_exchange(&self, id: ConnectionId, from: NodeId, px: PeerExchange) {
        if px.request {
            self.answer_query(id, from, &from).await;
            return;
        }
        if !self.take_query(id) {
            debug!("{} unsolicited peer list from {} dropped", id, from.short());
            return;
        }
        let own = self.identity.node_id;
        let peers: Vec<PeerRecord> = px
            .peers
            .into_iter()
            .filter(|p| p.node_id != own && !p.address.is_empty())
            .take(K * 2)
            .collect();
        for peer in &peers {
            self.dht.store_peer(peer.clone());
        }
        if !peers.is_empty() {
            self.emit(TransportEvent::PeersDiscovered { from, peers }).await;
        }
    }

    /// Deliver a punch request addressed to us, or pass it one hop on to an
    /// authenticated connection of its target
    async fn on_punch_request(&self, id: ConnectionId, from: NodeId, mut req: PunchRequest) {
        if !self.dht.allow_request(from) {
            debug!("{} punch request rate limited", id);
            return;
        }
        if req.target == self.identity.node_id {
            self.emit(TransportEvent::PunchRequested {
                conn_id: id,
                from: req.origin.unwrap_or(from),
                endpoint: req.endpoint,
                reply: req.reply,
            })
            .await;
            return;
        }
        if req.origin.is_some() {
            debug!("{} punch request already relayed once, dropped", id);
            return;
        }
        let Some(next) = self.conn_for_node(&req.target) else {
            debug!("{} punch target {} not connected", id, req.target.short());
            return;
        };
        req.origin = Some(from);
        if let Err(e) = self.send(next, &ProtocolMessage::PunchRequest(req)).await {
            debug!("{} punch relay failed: {}", id, e);
        }
    }

    async fn answer_query(&self, id: ConnectionId, from: NodeId, target: &NodeId) {
        match self.dht.handle_query(from, target) {
            Some(peers) => {
                let reply = ProtocolMessage::PeerExchange(PeerExchange {
                    request: false,
                    peers,
                });
                let _ = self.send(id, &reply).await;
            }
            None => debug!("{} DHT query rate limited", id),
        }
    }

    async fn tcp_accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("TCP accept failed: {}", e);
                            continue;
                        }
                    };
                    // over capacity: close right away instead of queueing
                    let (id, rx) = match self.register(remote, ConnectionKind::Tcp, Direction::Inbound) {
                        Ok(pair) => pair,
                        Err(_) => {
                            debug!("Rejecting {}: connection limit", remote);
                            drop(stream);
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    self.spawn_tcp(id, stream, rx);
                }
            }
        }
        debug!("TCP accept loop stopped");
    }

    async fn ws_accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("WebSocket accept failed: {}", e);
                            continue;
                        }
                    };
                    if !self.has_capacity() {
                        debug!("Rejecting ws {}: connection limit", remote);
                        drop(stream);
                        continue;
                    }
                    let inner = self.clone();
                    tokio::spawn(async move {
                        let upgrade = tokio::time::timeout(
                            inner.config.handshake_timeout,
                            tokio_tungstenite::accept_async(stream),
                        )
                        .await;
                        let ws = match upgrade {
                            Ok(Ok(ws)) => ws,
                            Ok(Err(e)) => {
                                debug!("WebSocket upgrade from {} failed: {}", remote, e);
                                return;
                            }
                            Err(_) => {
                                debug!("WebSocket upgrade from {} timed out", remote);
                                return;
                            }
                        };
                        match inner.register(remote, ConnectionKind::WebSocket, Direction::Inbound) {
                            Ok((id, rx)) => inner.spawn_ws(id, ws, rx),
                            Err(_) => debug!("Rejecting ws {}: connection limit", remote),
                        }
                    });
                }
            }
        }
        debug!("WebSocket accept loop stopped");
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.maintenance_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.maintain().await,
            }
        }
    }

    /// Ping quiet peers, drop silent or never-authenticated ones, purge the
    /// dedup cache and refresh stale DHT buckets
    async fn maintain(&self) {
        let now = Instant::now();
        let mut to_close = Vec::new();
        let mut to_ping = Vec::new();
        {
            let mut conns = self.connections.write();
            for (id, conn) in conns.iter_mut() {
                if !conn.info.authenticated {
                    if now.duration_since(conn.opened_at) > self.config.handshake_timeout {
                        to_close.push((*id, "handshake timeout"));
                    }
                    continue;
                }
                let quiet = now.duration_since(conn.last_seen);
                if quiet > self.config.peer_timeout {
                    to_close.push((*id, "peer timeout"));
                } else if quiet > self.config.ping_interval {
                    let due = conn
                        .last_ping
                        .map(|t| now.duration_since(t) > self.config.ping_interval)
                        .unwrap_or(true);
                    if due {
                        conn.last_ping = Some(now);
                        to_ping.push(conn.tx.clone());
                    }
                }
            }
        }

        for (id, reason) in to_close {
            self.disconnect(id, reason).await;
        }

        if !to_ping.is_empty() {
            let ping = ProtocolMessage::Ping(PingPayload {
                timestamp: now_millis(),
            });
            if let Ok(bytes) = ping.encode() {
                for tx in to_ping {
                    // a full queue means the peer is already backed up
                    let _ = tx.try_send(bytes.clone());
                }
            }
        }

        let purged = self.dedup.lock().evict_expired();
        if purged > 0 {
            debug!("Purged {} message ids from dedup cache", purged);
        }

        let targets = self.dht.refresh_targets();
        if !targets.is_empty() {
            let senders: Vec<mpsc::Sender<Bytes>> = self
                .connections
                .write()
                .values_mut()
                .filter(|c| c.info.authenticated)
                .take(REFRESH_FANOUT)
                .map(|c| {
                    c.outstanding_queries = c.outstanding_queries.saturating_add(targets.len() as u32);
                    c.tx.clone()
                })
                .collect();
            for target in targets {
                let msg = ProtocolMessage::FindNode(FindNode { target });
                if let Ok(bytes) = msg.encode() {
                    for tx in &senders {
                        let _ = tx.try_send(bytes.clone());
                    }
                }
            }
        }
    }
}

async fn tcp_writer(mut half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(bytes) = rx.recv().await {
        if half.write_all(&bytes).await.is_err() {
            break;
        }
    }
    let _ = half.shutdown().await;
}

async fn udp_writer(socket: Arc<UdpSocket>, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(bytes) = rx.recv().await {
        if bytes.len() > MAX_DATAGRAM {
            warn!("Dropping {}-byte frame: too large for a datagram", bytes.len());
            continue;
        }
        if let Err(e) = socket.send(&bytes).await {
            debug!("Datagram send failed: {}", e);
            break;
        }
    }
}

async fn ws_writer<S>(
    mut sink: futures::stream::SplitSink<WebSocketStream<S>, WsMessage>,
    mut rx: mpsc::Receiver<Bytes>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(bytes) = rx.recv().await {
        if sink.send(WsMessage::Binary(bytes.to_vec())).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}
