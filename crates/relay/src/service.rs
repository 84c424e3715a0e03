//! Relay service
//!
//! Consumes transport and hub events and applies store-and-forward rules:
//! - a MESSAGE for a reachable peer is forwarded, otherwise stored
//! - a RELAY_REQUEST is stored under its recipient key hash
//! - pending rows are pushed when their recipient authenticates or syncs
//!
//! Hub user sessions speak the same framed protocol as direct peers, so a
//! session must complete the signed handshake before anything privileged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mumblechat_core::{now_millis, MessageEnvelope, StoredMessage, DAY_MS};
use mumblechat_crypto::{is_key_hash, key_hash, node_id_from_wallet, verify_envelope};
use mumblechat_network::{
    ConnectionId, Frame, FrameDecoder, HandshakeAck, HandshakePayload, HubConnection, HubEvent,
    P2PTransport, PeerExchange, ProtocolMessage, RelayAckMode, RelayResponse,
    TransportEvent,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::store::{RelayStats, RelayStorage};

#[derive(Debug, Clone)]
pub struct RelayServiceConfig {
    /// TTL for MESSAGE frames stored because the recipient is offline
    pub default_ttl_days: u32,
    pub ack_mode: RelayAckMode,
    pub cleanup_interval: Duration,
}

impl Default for RelayServiceConfig {
    fn default() -> Self {
        Self {
            default_ttl_days: 7,
            ack_mode: RelayAckMode::Accepted,
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// What happened to a routed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Forwarded,
    Stored,
    Duplicate,
}

/// Where pending messages are pushed
#[derive(Debug, Clone)]
enum Route {
    Peer(ConnectionId),
    Hub(String),
}

struct HubSession {
    wallet: Option<String>,
    public_key: Option<[u8; 32]>,
    decoder: FrameDecoder,
}

impl HubSession {
    fn new() -> Self {
        Self {
            wallet: None,
            public_key: None,
            decoder: FrameDecoder::new(),
        }
    }
}

pub struct RelayService {
    config: RelayServiceConfig,
    transport: P2PTransport,
    storage: RelayStorage,
    hub: RwLock<Option<Arc<HubConnection>>>,
    sessions: Mutex<HashMap<String, HubSession>>,
}

impl RelayService {
    pub fn new(config: RelayServiceConfig, transport: P2PTransport, storage: RelayStorage) -> Self {
        Self {
            config,
            transport,
            storage,
            hub: RwLock::new(None),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &RelayStorage {
        &self.storage
    }

    pub fn transport(&self) -> &P2PTransport {
        &self.transport
    }

    pub fn stats(&self) -> RelayStats {
        self.storage.stats()
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.config.cleanup_interval
    }

    /// Attach the hub tunnel used to reach hub-side users
    pub fn set_hub(&self, hub: Arc<HubConnection>) {
        *self.hub.write() = Some(hub);
    }

    pub async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PeerAuthenticated(info) => {
                if let Some(wallet) = info.wallet_address {
                    self.deliver_pending(&wallet, None, Route::Peer(info.conn_id))
                        .await;
                }
            }
            TransportEvent::PeerDisconnected { .. }
            | TransportEvent::PeersDiscovered { .. }
            | TransportEvent::PunchRequested { .. } => {}
            TransportEvent::Message { envelope, .. } => {
                // the transport has already deduplicated
                self.route_message(envelope).await;
            }
            TransportEvent::RelayRequest { request, ack, .. } => {
                let stored = self.storage.store_relay_request(&request);
                if let Some(ack) = ack {
                    let _ = ack.send(RelayResponse {
                        message_id: stored.id.clone(),
                        accepted: true,
                        stored: true,
                        reason: None,
                    });
                }
                self.push_to_online(&stored.to).await;
            }
            TransportEvent::RelayResponse {
                from_wallet,
                response,
                ..
            } => {
                debug!(
                    "Relay response from {} for {}: accepted={} stored={}",
                    from_wallet, response.message_id, response.accepted, response.stored
                );
            }
            TransportEvent::SyncRequest {
                conn_id,
                wallet_address,
                since,
            } => {
                self.deliver_pending(&wallet_address, since, Route::Peer(conn_id))
                    .await;
            }
        }
    }

    pub async fn handle_hub_event(&self, event: HubEvent) {
        match event {
            HubEvent::Connected(tunnel) => {
                info!("Reachable through hub at {}", tunnel.endpoint);
            }
            HubEvent::AuthFailed(reason) => warn!("Hub auth failed: {}", reason),
            HubEvent::Disconnected => {
                let dropped = {
                    let mut sessions = self.sessions.lock();
                    let n = sessions.len();
                    sessions.clear();
                    n
                };
                if dropped > 0 {
                    debug!("Dropped {} hub sessions", dropped);
                }
            }
            HubEvent::UserConnected {
                session_id,
                wallet_address,
            } => {
                debug!("Hub session {} opened ({:?})", session_id, wallet_address);
                self.sessions.lock().insert(session_id, HubSession::new());
            }
            HubEvent::UserDisconnected { session_id } => {
                self.sessions.lock().remove(&session_id);
            }
            HubEvent::MessageFromUser { session_id, data } => {
                self.on_hub_data(&session_id, &data).await;
            }
        }
    }

    /// Forward to a reachable recipient, otherwise store with the default TTL
    pub async fn route_message(&self, envelope: MessageEnvelope) -> Delivery {
        let recipient = envelope.recipient_address.to_lowercase();
        let msg = ProtocolMessage::Message(envelope.clone());

        if self.transport.is_connected(&recipient)
            && self.transport.send_to_wallet(&recipient, &msg).await.is_ok()
        {
            debug!("Forwarded {} to {}", envelope.message_id, recipient);
            return Delivery::Forwarded;
        }
        if let Some(session) = self.session_for_wallet(&recipient) {
            if self.send_route(&Route::Hub(session), &msg).await.is_ok() {
                debug!("Forwarded {} to {} via hub", envelope.message_id, recipient);
                return Delivery::Forwarded;
            }
        }

        let now = now_millis();
        let row = StoredMessage {
            id: envelope.message_id.clone(),
            from: key_hash(&envelope.sender_address),
            to: key_hash(&recipient),
            encrypted_content: envelope.encrypted_blob,
            timestamp: now,
            expires_at: now + self.config.default_ttl_days.max(1) as u64 * DAY_MS,
            delivered: false,
            delivered_at: None,
        };
        if self.storage.store_message(row) {
            Delivery::Stored
        } else {
            Delivery::Duplicate
        }
    }

    /// Purge expired rows
    pub fn cleanup(&self) -> usize {
        let removed = self.storage.cleanup_expired();
        if removed > 0 {
            info!("Cleaned up {} expired messages", removed);
        }
        removed
    }

    /// Push pending rows for `wallet`; returns how many were delivered
    async fn deliver_pending(&self, wallet: &str, since: Option<u64>, route: Route) -> usize {
        let wallet = wallet.to_lowercase();
        let pending = self.storage.get_pending_messages(&key_hash(&wallet));
        let mut delivered = 0;
        for row in pending {
            if since.map(|s| row.timestamp < s).unwrap_or(false) {
                continue;
            }
            let id = row.id.clone();
            let envelope = MessageEnvelope {
                message_id: row.id,
                sender_address: row.from,
                recipient_address: wallet.clone(),
                encrypted_blob: row.encrypted_content,
                timestamp: row.timestamp,
                signature: String::new(),
            };
            if let Err(e) = self.send_route(&route, &ProtocolMessage::Message(envelope)).await {
                warn!("Stopped delivering to {}: {}", wallet, e);
                break;
            }
            self.storage.mark_delivered(&id);
            delivered += 1;
        }
        if delivered > 0 {
            info!("Delivered {} stored messages to {}", delivered, wallet);
        }
        delivered
    }

    /// Deliver immediately if the owner of `recipient_hash` is online
    async fn push_to_online(&self, recipient_hash: &str) {
        let peer = self
            .transport
            .authenticated_peers()
            .into_iter()
            .find_map(|p| match p.wallet_address {
                Some(w) if key_hash(&w) == recipient_hash => Some((w, Route::Peer(p.conn_id))),
                _ => None,
            });
        let target = peer.or_else(|| {
            self.sessions.lock().iter().find_map(|(id, s)| match &s.wallet {
                Some(w) if key_hash(w) == recipient_hash => Some((w.clone(), Route::Hub(id.clone()))),
                _ => None,
            })
        });
        if let Some((wallet, route)) = target {
            self.deliver_pending(&wallet, None, route).await;
        }
    }

    fn session_for_wallet(&self, wallet: &str) -> Option<String> {
        self.sessions
            .lock()
            .iter()
            .find(|(_, s)| s.wallet.as_deref() == Some(wallet))
            .map(|(id, _)| id.clone())
    }

    async fn send_route(&self, route: &Route, msg: &ProtocolMessage) -> Result<()> {
        match route {
            Route::Peer(conn_id) => Ok(self.transport.send(*conn_id, msg).await?),
            Route::Hub(session_id) => {
                let hub = self
                    .hub
                    .read()
                    .clone()
                    .ok_or_else(|| RelayError::Rejected("no hub tunnel".to_string()))?;
                let bytes = msg
                    .encode()
                    .map_err(|e| RelayError::Serialization(e.to_string()))?;
                Ok(hub.send_to_user(session_id, &bytes).await?)
            }
        }
    }

    async fn on_hub_data(&self, session_id: &str, data: &[u8]) {
        let frames = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .entry(session_id.to_string())
                .or_insert_with(HubSession::new);
            session.decoder.push(data);
            let mut frames = Vec::new();
            loop {
                match session.decoder.next_frame() {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Hub session {} stream error: {}", session_id, e);
                        sessions.remove(session_id);
                        break;
                    }
                }
            }
            frames
        };
        for frame in frames {
            self.on_hub_frame(session_id, frame).await;
        }
    }

    async fn on_hub_frame(&self, session_id: &str, frame: Frame) {
        let (wallet, peer_key) = match self.sessions.lock().get(session_id) {
            Some(s) => (s.wallet.clone(), s.public_key),
            None => return,
        };
        let frame_type = match frame.frame_type() {
            Ok(t) => t,
            Err(e) => {
                warn!("Hub session {} dropping frame: {}", session_id, e);
                return;
            }
        };
        if wallet.is_none() && !frame_type.allowed_before_auth() {
            warn!(
                "Hub session {} dropping {:?} before handshake",
                session_id, frame_type
            );
            return;
        }
        let msg = match ProtocolMessage::from_frame(&frame) {
            Ok(m) => m,
            Err(e) => {
                warn!("Hub session {} dropping frame: {}", session_id, e);
                return;
            }
        };
        let route = Route::Hub(session_id.to_string());

        match msg {
            ProtocolMessage::Handshake(claim) => {
                if wallet.is_some() {
                    return;
                }
                self.on_hub_handshake(session_id, claim).await;
            }
            ProtocolMessage::Ping(p) => {
                let _ = self.send_route(&route, &ProtocolMessage::Pong(p)).await;
            }
            ProtocolMessage::Message(envelope) => {
                let from = wallet.unwrap_or_default();
                if envelope.sender_address.eq_ignore_ascii_case(&from) {
                    let valid = peer_key
                        .map(|key| verify_envelope(&envelope, &key))
                        .unwrap_or(false);
                    if !valid {
                        warn!("Bad signature on {} from hub session {}", envelope.message_id, session_id);
                        return;
                    }
                }
                // one id space with the direct transport
                if !self.transport.first_sighting(&envelope.message_id) {
                    debug!("Duplicate {} from hub session {}", envelope.message_id, session_id);
                    return;
                }
                self.route_message(envelope).await;
            }
            ProtocolMessage::RelayRequest(mut request) => {
                let from = wallet.unwrap_or_default();
                if request.message_id.is_empty() || !is_key_hash(&request.recipient_key_hash) {
                    let resp = RelayResponse {
                        message_id: request.message_id,
                        accepted: false,
                        stored: false,
                        reason: Some("invalid relay request".to_string()),
                    };
                    let _ = self.send_route(&route, &ProtocolMessage::RelayResponse(resp)).await;
                    return;
                }
                request.sender_key_hash = key_hash(&from);
                let stored = self.storage.store_relay_request(&request);
                let resp = RelayResponse {
                    message_id: stored.id.clone(),
                    accepted: true,
                    stored: self.config.ack_mode == RelayAckMode::Persisted,
                    reason: None,
                };
                let _ = self.send_route(&route, &ProtocolMessage::RelayResponse(resp)).await;
                self.push_to_online(&stored.to).await;
            }
            ProtocolMessage::SyncRequest(req) => {
                if let Some(wallet) = wallet {
                    self.deliver_pending(&wallet, req.since, route).await;
                }
            }
            ProtocolMessage::PeerExchange(PeerExchange { request: true, .. }) | ProtocolMessage::FindNode(_) => {
                let Some(wallet) = wallet else { return };
                let from = node_id_from_wallet(&wallet);
                let target = match &msg {
                    ProtocolMessage::FindNode(f) => f.target,
                    _ => from,
                };
                if let Some(peers) = self.transport.dht().handle_query(from, &target) {
                    let reply = ProtocolMessage::PeerExchange(PeerExchange {
                        request: false,
                        peers,
                    });
                    let _ = self.send_route(&route, &reply).await;
                }
            }
            ProtocolMessage::HandshakeAck(_)
            | ProtocolMessage::Pong(_)
            | ProtocolMessage::RelayResponse(_)
            | ProtocolMessage::PeerExchange(_)
            | ProtocolMessage::PunchRequest(_) => {}
        }
    }

    async fn on_hub_handshake(&self, session_id: &str, claim: HandshakePayload) {
        let route = Route::Hub(session_id.to_string());
        match claim.verify(now_millis()) {
            Ok(key) => {
                let wallet = claim.wallet_address.to_lowercase();
                if let Some(session) = self.sessions.lock().get_mut(session_id) {
                    session.wallet = Some(wallet.clone());
                    session.public_key = Some(key);
                }
                let ack = ProtocolMessage::HandshakeAck(HandshakeAck {
                    accepted: true,
                    reason: None,
                    handshake: Some(HandshakePayload::signed(
                        self.transport.identity(),
                        now_millis(),
                        None,
                    )),
                });
                let _ = self.send_route(&route, &ack).await;
                info!("Hub session {} authenticated as {}", session_id, wallet);
                self.deliver_pending(&wallet, None, route).await;
            }
            Err(e) => {
                warn!("Hub session {} handshake rejected: {}", session_id, e);
                let ack = ProtocolMessage::HandshakeAck(HandshakeAck {
                    accepted: false,
                    reason: Some(e.to_string()),
                    handshake: None,
                });
                let _ = self.send_route(&route, &ack).await;
                self.sessions.lock().remove(session_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mumblechat_crypto::{sign_envelope, NodeIdentity};
    use mumblechat_network::{Dht, TransportConfig};
    use tokio::sync::mpsc;

    fn test_config() -> TransportConfig {
        TransportConfig {
            bind_addr: "127.0.0.1".to_string(),
            tcp_port: 0,
            ws_port: None,
            maintenance_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    async fn start_node() -> (P2PTransport, mpsc::Receiver<TransportEvent>) {
        let identity = NodeIdentity::generate();
        let dht = Arc::new(Dht::new(identity.node_id));
        P2PTransport::start(test_config(), identity, dht).await.unwrap()
    }

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_offline_recipient_is_stored_then_delivered_on_auth() {
        let (relay_t, mut relay_rx) = start_node().await;
        let relay = RelayService::new(
            RelayServiceConfig::default(),
            relay_t.clone(),
            RelayStorage::in_memory(30),
        );

        let alice = NodeIdentity::generate();
        let bob_id = NodeIdentity::generate();
        let env = sign_envelope(&alice, "m-1", &bob_id.wallet_address, vec![7, 7], now_millis());
        assert_eq!(relay.route_message(env.clone()).await, Delivery::Stored);
        assert_eq!(relay.route_message(env).await, Delivery::Duplicate);
        assert_eq!(
            relay.storage().get_pending_messages(&key_hash(&bob_id.wallet_address)).len(),
            1
        );

        // bob comes online
        let dht = Arc::new(Dht::new(bob_id.node_id));
        let (bob, mut bob_rx) = P2PTransport::start(test_config(), bob_id.clone(), dht)
            .await
            .unwrap();
        bob.connect(&relay_t.local_addr().to_string()).await.unwrap();

        let ev = next_event(&mut relay_rx).await;
        assert!(matches!(ev, TransportEvent::PeerAuthenticated(_)));
        relay.handle_transport_event(ev).await;

        loop {
            match next_event(&mut bob_rx).await {
                TransportEvent::Message { envelope, .. } => {
                    assert_eq!(envelope.message_id, "m-1");
                    assert_eq!(envelope.encrypted_blob, vec![7, 7]);
                    assert_eq!(envelope.sender_address, key_hash(&alice.wallet_address));
                    break;
                }
                TransportEvent::PeerAuthenticated(_) => continue,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(relay.storage().get("m-1").unwrap().delivered);
        assert_eq!(relay.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_connected_recipient_is_forwarded() {
        let (relay_t, mut relay_rx) = start_node().await;
        let relay = RelayService::new(
            RelayServiceConfig::default(),
            relay_t.clone(),
            RelayStorage::in_memory(30),
        );
        let (bob, mut bob_rx) = start_node().await;
        bob.connect(&relay_t.local_addr().to_string()).await.unwrap();
        let _ = next_event(&mut relay_rx).await;

        let alice = NodeIdentity::generate();
        let env = sign_envelope(&alice, "m-2", &bob.identity().wallet_address, vec![1], now_millis());
        assert_eq!(relay.route_message(env).await, Delivery::Forwarded);
        assert!(relay.storage().is_empty());

        loop {
            if let TransportEvent::Message { envelope, .. } = next_event(&mut bob_rx).await {
                assert_eq!(envelope.message_id, "m-2");
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_sync_request_respects_since() {
        let (relay_t, mut relay_rx) = start_node().await;
        let relay = RelayService::new(
            RelayServiceConfig::default(),
            relay_t.clone(),
            RelayStorage::in_memory(30),
        );
        let (bob, mut bob_rx) = start_node().await;
        let hash = key_hash(&bob.identity().wallet_address);
        for (id, ts) in [("old", 100u64), ("new", 200u64)] {
            relay.storage().store_message(StoredMessage {
                id: id.to_string(),
                from: "x".to_string(),
                to: hash.clone(),
                encrypted_content: vec![],
                timestamp: ts,
                expires_at: u64::MAX,
                delivered: false,
                delivered_at: None,
            });
        }

        bob.connect(&relay_t.local_addr().to_string()).await.unwrap();
        // handled as a sync rather than an auth push
        let conn_id = match next_event(&mut relay_rx).await {
            TransportEvent::PeerAuthenticated(info) => info.conn_id,
            other => panic!("unexpected {:?}", other),
        };
        relay
            .handle_transport_event(TransportEvent::SyncRequest {
                conn_id,
                wallet_address: bob.identity().wallet_address.clone(),
                since: Some(150),
            })
            .await;

        loop {
            if let TransportEvent::Message { envelope, .. } = next_event(&mut bob_rx).await {
                assert_eq!(envelope.message_id, "new");
                break;
            }
        }
        assert!(relay.storage().get("new").unwrap().delivered);
        assert!(!relay.storage().get("old").unwrap().delivered);
    }

    /// Open an authenticated hub session for `user`
    async fn hub_login(relay: &RelayService, session: &str, user: &NodeIdentity) {
        relay
            .handle_hub_event(HubEvent::UserConnected {
                session_id: session.to_string(),
                wallet_address: Some(user.wallet_address.clone()),
            })
            .await;
        let hello = ProtocolMessage::Handshake(HandshakePayload::signed(user, now_millis(), None));
        hub_send(relay, session, &hello).await;
    }

    async fn hub_send(relay: &RelayService, session: &str, msg: &ProtocolMessage) {
        relay
            .handle_hub_event(HubEvent::MessageFromUser {
                session_id: session.to_string(),
                data: msg.encode().unwrap().to_vec(),
            })
            .await;
    }

    #[tokio::test]
    async fn test_hub_forgery_does_not_block_genuine_message() {
        let (relay_t, _rx) = start_node().await;
        let relay = RelayService::new(
            RelayServiceConfig::default(),
            relay_t,
            RelayStorage::in_memory(30),
        );
        let alice = NodeIdentity::generate();
        let bob = NodeIdentity::generate();
        hub_login(&relay, "s-1", &alice).await;

        let genuine = sign_envelope(&alice, "h-1", &bob.wallet_address, vec![1], now_millis());
        let mut forged = genuine.clone();
        forged.encrypted_blob = vec![6, 6, 6];
        forged.signature = sign_envelope(&bob, "h-1", &bob.wallet_address, vec![], 0).signature;

        hub_send(&relay, "s-1", &ProtocolMessage::Message(forged)).await;
        assert!(relay.storage().get("h-1").is_none());
        hub_send(&relay, "s-1", &ProtocolMessage::Message(genuine)).await;
        assert_eq!(relay.storage().get("h-1").unwrap().encrypted_content, vec![1]);
    }

    #[tokio::test]
    async fn test_hub_and_direct_share_message_ids() {
        let (relay_t, mut relay_rx) = start_node().await;
        let relay = RelayService::new(
            RelayServiceConfig::default(),
            relay_t.clone(),
            RelayStorage::in_memory(30),
        );
        let (alice, _alice_rx) = start_node().await;
        let (bob, mut bob_rx) = start_node().await;
        alice.connect(&relay_t.local_addr().to_string()).await.unwrap();
        bob.connect(&relay_t.local_addr().to_string()).await.unwrap();
        let env = sign_envelope(alice.identity(), "both-ways", &bob.identity().wallet_address, vec![3], now_millis());

        // direct copy first
        alice
            .send_to_wallet(&relay_t.identity().wallet_address, &ProtocolMessage::Message(env.clone()))
            .await
            .unwrap();
        loop {
            let ev = next_event(&mut relay_rx).await;
            let is_msg = matches!(ev, TransportEvent::Message { .. });
            relay.handle_transport_event(ev).await;
            if is_msg {
                break;
            }
        }
        loop {
            if let TransportEvent::Message { envelope, .. } = next_event(&mut bob_rx).await {
                assert_eq!(envelope, env);
                break;
            }
        }

        // same message again through a hub session
        hub_login(&relay, "s-2", alice.identity()).await;
        hub_send(&relay, "s-2", &ProtocolMessage::Message(env)).await;
        let again = tokio::time::timeout(Duration::from_millis(300), async {
            loop {
                if let Some(TransportEvent::Message { .. }) = bob_rx.recv().await {
                    return;
                }
            }
        })
        .await;
        assert!(again.is_err(), "hub copy must be recognised as a duplicate");
        assert!(relay.storage().is_empty());
    }

    #[tokio::test]
    async fn test_hub_relay_request_needs_key_hash() {
        let (relay_t, _rx) = start_node().await;
        let relay = RelayService::new(
            RelayServiceConfig::default(),
            relay_t,
            RelayStorage::in_memory(30),
        );
        let alice = NodeIdentity::generate();
        hub_login(&relay, "s-3", &alice).await;

        let mut req = mumblechat_core::RelayRequest {
            message_id: "rr".to_string(),
            recipient_key_hash: "ééééééééééééé".to_string(),
            sender_key_hash: String::new(),
            encrypted_blob: vec![1],
            ttl_days: 7,
            timestamp: now_millis(),
            signature: String::new(),
        };
        hub_send(&relay, "s-3", &ProtocolMessage::RelayRequest(req.clone())).await;
        assert!(relay.storage().is_empty());

        req.recipient_key_hash = key_hash("0x00000000000000000000000000000000000000cc");
        hub_send(&relay, "s-3", &ProtocolMessage::RelayRequest(req)).await;
        assert_eq!(relay.storage().get("rr").unwrap().from, key_hash(&alice.wallet_address));
    }

    #[tokio::test]
    async fn test_cleanup_counts_expired() {
        let (relay_t, _rx) = start_node().await;
        let relay = RelayService::new(
            RelayServiceConfig::default(),
            relay_t,
            RelayStorage::in_memory(30),
        );
        relay.storage().store_message(StoredMessage {
            id: "gone".to_string(),
            from: "x".to_string(),
            to: "y".to_string(),
            encrypted_content: vec![],
            timestamp: 1,
            expires_at: 2,
            delivered: false,
            delivered_at: None,
        });
        assert_eq!(relay.cleanup(), 1);
        assert_eq!(relay.stats().expired, 1);
    }
}
