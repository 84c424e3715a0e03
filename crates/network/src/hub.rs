//! Hub tunnel
//!
//! A single outbound WebSocket to a well-known hub, used when the node is not
//! directly reachable. The hub assigns a public endpoint and multiplexes user
//! sessions over the tunnel. User traffic is carried as base64 protocol
//! frames, the same bytes a direct peer would send over TCP.
//!
//! On an unexpected close the connection is retried at a fixed interval until
//! [`HubConnection::disconnect`] is called.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use mumblechat_core::now_millis;
use mumblechat_crypto::NodeIdentity;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// Missed heartbeat acks tolerated before the tunnel is considered dead
const MAX_MISSED_HEARTBEATS: u32 = 3;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Hub not connected")]
    NotConnected,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Hub connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, HubError>;

/// Messages exchanged with the hub, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HubMessage {
    #[serde(rename_all = "camelCase")]
    NodeAuth {
        wallet_address: String,
        public_key: String,
        node_id: String,
        timestamp: u64,
        signature: String,
    },
    #[serde(rename_all = "camelCase")]
    AuthSuccess {
        tunnel_id: String,
        endpoint: String,
        http_endpoint: String,
        #[serde(default)]
        hub_fee_percent: f64,
    },
    #[serde(rename_all = "camelCase")]
    AuthFailed {
        #[serde(default)]
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    UserConnected {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wallet_address: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    UserDisconnected { session_id: String },
    /// `data` is a base64 encoded protocol frame
    #[serde(rename_all = "camelCase")]
    MessageFromUser { session_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    MessageToUser { session_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    Heartbeat { timestamp: u64 },
    #[serde(rename_all = "camelCase")]
    HeartbeatAck { timestamp: u64 },
}

/// Public endpoint assigned by the hub
#[derive(Debug, Clone, PartialEq)]
pub struct HubTunnel {
    pub tunnel_id: String,
    pub endpoint: String,
    pub http_endpoint: String,
    pub hub_fee_percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Connected(HubTunnel),
    AuthFailed(String),
    Disconnected,
    UserConnected {
        session_id: String,
        wallet_address: Option<String>,
    },
    UserDisconnected {
        session_id: String,
    },
    /// Raw frame bytes from a user session
    MessageFromUser {
        session_id: String,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub url: String,
    pub heartbeat_interval: Duration,
    pub reconnect_interval: Duration,
    /// Bound on the TCP, TLS and WebSocket upgrade for one attempt
    pub connect_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: "wss://hub.mumblechat.com/node/connect".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Handle to the hub tunnel task
pub struct HubConnection {
    tunnel: Arc<RwLock<Option<HubTunnel>>>,
    outbound: mpsc::Sender<HubMessage>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HubConnection {
    /// Start connecting in the background; returns immediately
    pub fn connect(config: HubConfig, identity: NodeIdentity) -> (Self, mpsc::Receiver<HubEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let (stop_tx, stop_rx) = watch::channel(false);
        let tunnel = Arc::new(RwLock::new(None));

        let worker = HubWorker {
            config,
            identity,
            tunnel: tunnel.clone(),
            events: events_tx,
            outbound: outbound_rx,
            stop: stop_rx,
        };
        let task = tokio::spawn(worker.run());

        (
            Self {
                tunnel,
                outbound: outbound_tx,
                stop: stop_tx,
                task: Mutex::new(Some(task)),
            },
            events_rx,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.tunnel.read().is_some()
    }

    pub fn tunnel(&self) -> Option<HubTunnel> {
        self.tunnel.read().clone()
    }

    /// Send raw frame bytes to a user session
    pub async fn send_to_user(&self, session_id: &str, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(HubError::NotConnected);
        }
        let msg = HubMessage::MessageToUser {
            session_id: session_id.to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(data),
        };
        self.outbound.send(msg).await.map_err(|_| HubError::Closed)
    }

    /// Close the tunnel and stop reconnecting
    pub async fn disconnect(&self) {
        let _ = self.stop.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        *self.tunnel.write() = None;
        info!("Hub tunnel disconnected");
    }
}

impl Drop for HubConnection {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

struct HubWorker {
    config: HubConfig,
    identity: NodeIdentity,
    tunnel: Arc<RwLock<Option<HubTunnel>>>,
    events: mpsc::Sender<HubEvent>,
    outbound: mpsc::Receiver<HubMessage>,
    stop: watch::Receiver<bool>,
}

enum SessionEnd {
    Stopped,
    Lost(String),
}

impl HubWorker {
    async fn run(mut self) {
        loop {
            if *self.stop.borrow() {
                break;
            }

            let attempt = tokio::time::timeout(
                self.config.connect_timeout,
                tokio_tungstenite::connect_async(self.config.url.as_str()),
            );
            let connected = tokio::select! {
                _ = self.stop.changed() => break,
                res = attempt => res,
            };

            match connected {
                Ok(Ok((ws, _response))) => {
                    debug!("Hub socket open: {}", self.config.url);
                    let end = self.session(ws).await;
                    let was_up = self.tunnel.write().take().is_some();
                    if was_up {
                        let _ = self.events.send(HubEvent::Disconnected).await;
                    }
                    match end {
                        SessionEnd::Stopped => break,
                        SessionEnd::Lost(reason) => warn!(
                            "Hub connection lost ({}), reconnecting in {:?}",
                            reason, self.config.reconnect_interval
                        ),
                    }
                }
                Ok(Err(e)) => warn!(
                    "Hub connection failed (retry in {:?}): {}",
                    self.config.reconnect_interval, e
                ),
                Err(_) => warn!(
                    "Hub connection timed out after {:?} (retry in {:?})",
                    self.config.connect_timeout, self.config.reconnect_interval
                ),
            }

            tokio::select! {
                _ = self.stop.changed() => break,
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }
        debug!("Hub worker stopped");
    }

    fn auth_message(&self) -> HubMessage {
        let timestamp = now_millis();
        HubMessage::NodeAuth {
            wallet_address: self.identity.wallet_address.clone(),
            public_key: hex::encode(self.identity.public_key()),
            node_id: self.identity.node_id.to_hex(),
            timestamp,
            signature: self.identity.sign_handshake(timestamp),
        }
    }

    async fn session<S>(&mut self, ws: tokio_tungstenite::WebSocketStream<S>) -> SessionEnd
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws.split();

        match encode(&self.auth_message()) {
            Ok(text) => {
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    return SessionEnd::Lost(e.to_string());
                }
            }
            Err(e) => return SessionEnd::Lost(e.to_string()),
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;
        let mut missed: u32 = 0;

        loop {
            tokio::select! {
                _ = self.stop.changed() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return SessionEnd::Stopped;
                }
                _ = heartbeat.tick() => {
                    if missed >= MAX_MISSED_HEARTBEATS {
                        return SessionEnd::Lost("heartbeat timeout".to_string());
                    }
                    missed += 1;
                    let beat = HubMessage::Heartbeat { timestamp: now_millis() };
                    if let Ok(text) = encode(&beat) {
                        if write.send(WsMessage::Text(text)).await.is_err() {
                            return SessionEnd::Lost("heartbeat send failed".to_string());
                        }
                    }
                }
                Some(msg) = self.outbound.recv() => {
                    match encode(&msg) {
                        Ok(text) => {
                            if let Err(e) = write.send(WsMessage::Text(text)).await {
                                return SessionEnd::Lost(e.to_string());
                            }
                        }
                        Err(e) => warn!("Dropping hub message: {}", e),
                    }
                }
                incoming = read.next() => {
                    let text = match incoming {
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(WsMessage::Binary(bin))) => match String::from_utf8(bin) {
                            Ok(text) => text,
                            Err(_) => continue,
                        },
                        Some(Ok(WsMessage::Close(_))) | None => {
                            return SessionEnd::Lost("closed by hub".to_string());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    };
                    missed = 0;
                    let msg: HubMessage = match serde_json::from_str(&text) {
                        Ok(m) => m,
                        Err(e) => {
                            debug!("Ignoring hub message: {}", e);
                            continue;
                        }
                    };
                    if let Some(reply) = self.dispatch(msg).await {
                        if let Ok(text) = encode(&reply) {
                            let _ = write.send(WsMessage::Text(text)).await;
                        }
                    }
                }
            }
        }
    }

    /// Handle one hub message; returns a reply to send, if any
    async fn dispatch(&self, msg: HubMessage) -> Option<HubMessage> {
        match msg {
            HubMessage::AuthSuccess {
                tunnel_id,
                endpoint,
                http_endpoint,
                hub_fee_percent,
            } => {
                let tunnel = HubTunnel {
                    tunnel_id,
                    endpoint,
                    http_endpoint,
                    hub_fee_percent,
                };
                info!(
                    "Hub tunnel {} established, public endpoint {}",
                    tunnel.tunnel_id, tunnel.endpoint
                );
                *self.tunnel.write() = Some(tunnel.clone());
                let _ = self.events.send(HubEvent::Connected(tunnel)).await;
                None
            }
            HubMessage::AuthFailed { reason } => {
                warn!("Hub rejected node auth: {}", reason);
                let _ = self.events.send(HubEvent::AuthFailed(reason)).await;
                None
            }
            HubMessage::UserConnected {
                session_id,
                wallet_address,
            } => {
                debug!("Hub user session {} opened", session_id);
                let _ = self
                    .events
                    .send(HubEvent::UserConnected {
                        session_id,
                        wallet_address,
                    })
                    .await;
                None
            }
            HubMessage::UserDisconnected { session_id } => {
                let _ = self
                    .events
                    .send(HubEvent::UserDisconnected { session_id })
                    .await;
                None
            }
            HubMessage::MessageFromUser { session_id, data } => {
                match base64::engine::general_purpose::STANDARD.decode(&data) {
                    Ok(data) => {
                        let _ = self
                            .events
                            .send(HubEvent::MessageFromUser { session_id, data })
                            .await;
                    }
                    Err(e) => warn!("Bad payload from hub session {}: {}", session_id, e),
                }
                None
            }
            HubMessage::Heartbeat { timestamp } => Some(HubMessage::HeartbeatAck { timestamp }),
            HubMessage::HeartbeatAck { .. } => None,
            HubMessage::NodeAuth { .. } | HubMessage::MessageToUser { .. } => {
                debug!("Ignoring unexpected hub message direction");
                None
            }
        }
    }
}

fn encode(msg: &HubMessage) -> Result<String> {
    serde_json::to_string(msg).map_err(|e| HubError::Serialization(e.to_string()))
}
