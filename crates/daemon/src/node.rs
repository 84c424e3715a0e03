//! Relay node runtime
//!
//! Startup order: PID file, relay storage, NAT discovery, listeners, hub
//! tunnel (when needed), bootstrap. The event loop then feeds transport and
//! hub events to the relay service one at a time, which keeps per-connection
//! ordering. Shutdown flushes storage, closes every socket and the tunnel,
//! and removes the PID file.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mumblechat_core::{now_millis, NodeInstance};
use mumblechat_crypto::NodeIdentity;
use mumblechat_network::{
    BootstrapCandidate, BootstrapManager, Dht, EndpointSource, HolePunchConfig, HubConfig,
    HubConnection, HubEvent, NatType, P2PTransport, PeerCache, PeerRecord, PunchCoordinator,
    RelayAckMode, StunClient, TransportConfig, TransportEvent,
};
use mumblechat_registry::{RegistryClient, RegistryConfig, RegistryMode as ClientMode, RegistryResolver};
use mumblechat_relay::{RelayService, RelayServiceConfig, RelayStorage, StorageConfig};
use mumblechat_settings::{AckMode, HubMode, RegistryMode, Settings};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::instances;
use crate::pid::PidGuard;
use crate::Result;

/// Everything one relay process needs
pub struct NodeConfig {
    pub identity: NodeIdentity,
    pub transport: TransportConfig,
    pub storage: StorageConfig,
    pub relay: RelayServiceConfig,
    pub hub: HubConfig,
    pub hub_mode: HubMode,
    pub stun_servers: Vec<String>,
    pub enable_hole_punching: bool,
    pub bootstrap_peers: Vec<String>,
    pub peer_cache_path: PathBuf,
    pub registry: Option<RegistryConfig>,
    pub registry_cache_ttl: Duration,
    /// Directory for the PID file; `None` skips it
    pub pid_dir: Option<PathBuf>,
}

impl NodeConfig {
    /// Runtime config for a configured instance, settings supplying the rest
    pub fn for_instance(settings: &Settings, instance: &NodeInstance, identity: NodeIdentity) -> Self {
        let mut config = Self::from_settings(settings, identity, &instance.data_path);
        config.transport.tcp_port = instance.p2p_port;
        config.transport.ws_port = Some(instance.ws_port);
        config.storage.path = Some(instances::store_path(instance));
        config.peer_cache_path = instances::peer_cache_path(instance);
        config
    }

    /// Single-node config rooted at `data_dir`
    pub fn from_settings(settings: &Settings, identity: NodeIdentity, data_dir: &Path) -> Self {
        let net = &settings.network;
        let transport = TransportConfig {
            bind_addr: net.bind_addr.clone(),
            tcp_port: net.p2p_port,
            ws_port: Some(net.ws_port()),
            max_connections: net.max_connections,
            ping_interval: Duration::from_secs(net.ping_interval_secs),
            peer_timeout: Duration::from_secs(net.peer_timeout_secs),
            maintenance_interval: Duration::from_secs(net.maintenance_interval_secs),
            ack_mode: transport_ack(settings.relay.ack_mode),
            ..Default::default()
        };

        let registry = if settings.registry.registry_address.is_empty()
            && settings.registry.mode == RegistryMode::Live
        {
            warn!("Live registry configured without an address; skipping registry bootstrap");
            None
        } else {
            Some(RegistryConfig {
                mode: match settings.registry.mode {
                    RegistryMode::Mock => ClientMode::Mock,
                    RegistryMode::Live => ClientMode::Live,
                },
                rpc_url: settings.registry.rpc_url.clone(),
                registry_address: settings.registry.registry_address.clone(),
                token_address: settings.registry.token_address.clone(),
            })
        };

        Self {
            transport,
            storage: StorageConfig {
                path: Some(data_dir.join("data").join("messages.json")),
                max_ttl_days: settings.relay.max_ttl_days,
                flush_debounce: Duration::from_millis(settings.relay.flush_debounce_ms),
            },
            relay: RelayServiceConfig {
                default_ttl_days: settings.relay.default_ttl_days,
                ack_mode: transport_ack(settings.relay.ack_mode),
                cleanup_interval: Duration::from_secs(settings.relay.cleanup_interval_secs.max(1)),
            },
            hub: HubConfig {
                url: settings.hub.url.clone(),
                heartbeat_interval: Duration::from_secs(settings.hub.heartbeat_interval_secs.max(1)),
                reconnect_interval: Duration::from_secs(settings.hub.reconnect_interval_secs.max(1)),
                ..Default::default()
            },
            hub_mode: settings.hub.enabled,
            stun_servers: net.stun_servers.clone(),
            enable_hole_punching: net.enable_hole_punching,
            bootstrap_peers: net.bootstrap_peers.clone(),
            peer_cache_path: data_dir.join("cache").join("peers.json"),
            registry,
            registry_cache_ttl: Duration::from_secs(settings.registry.cache_ttl_secs),
            pid_dir: Some(data_dir.to_path_buf()),
            identity,
        }
    }
}

fn transport_ack(mode: AckMode) -> RelayAckMode {
    match mode {
        AckMode::Accepted => RelayAckMode::Accepted,
        AckMode::Persisted => RelayAckMode::Persisted,
    }
}

/// Whether the hub tunnel should be opened for this NAT
pub fn needs_hub(mode: HubMode, nat: NatType) -> bool {
    match mode {
        HubMode::Always => true,
        HubMode::Never => false,
        HubMode::Auto => !nat.is_directly_reachable(),
    }
}

/// Resolves on ctrl-c or (unix) SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn recv_hub(rx: &mut Option<mpsc::Receiver<HubEvent>>) -> Option<HubEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

pub struct NodeService {
    config: NodeConfig,
}

impl NodeService {
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    /// Run until ctrl-c or SIGTERM
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` resolves
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let config = self.config;
        let identity = config.identity.clone();
        info!(
            "Starting relay node {} ({})",
            identity.node_id.short(),
            identity.wallet_address
        );

        let _pid = match &config.pid_dir {
            Some(dir) => Some(PidGuard::acquire(dir)?),
            None => None,
        };

        let storage = RelayStorage::open(config.storage.clone())?;
        let flusher = storage.spawn_flusher();

        let nat = if config.hub_mode == HubMode::Auto || config.enable_hole_punching {
            let stun = StunClient::with_servers(config.stun_servers.clone());
            let nat = stun.detect_nat_type().await;
            info!("NAT type: {}", nat);
            nat
        } else {
            NatType::Unknown
        };

        let dht = Arc::new(Dht::new(identity.node_id));
        let (transport, mut events) =
            P2PTransport::start(config.transport.clone(), identity.clone(), dht).await?;
        match transport.ws_local_addr() {
            Some(ws) => info!("Listening on {} (WebSocket {})", transport.local_addr(), ws),
            None => info!("Listening on {}", transport.local_addr()),
        }

        let relay = Arc::new(RelayService::new(config.relay.clone(), transport.clone(), storage.clone()));

        let mut hub_events = None;
        let hub = if needs_hub(config.hub_mode, nat) {
            info!("Opening hub tunnel to {}", config.hub.url);
            let (hub, rx) = HubConnection::connect(config.hub.clone(), identity.clone());
            let hub = Arc::new(hub);
            relay.set_hub(hub.clone());
            hub_events = Some(rx);
            Some(hub)
        } else {
            None
        };

        let cache = Arc::new(Mutex::new(PeerCache::load(&config.peer_cache_path)));
        let resolver: Option<Arc<dyn EndpointSource>> = config.registry.clone().map(|rc| {
            let client = Arc::new(RegistryClient::new(rc, &identity.wallet_address));
            Arc::new(RegistryResolver::new(client, config.registry_cache_ttl)) as Arc<dyn EndpointSource>
        });
        let bootstrap = BootstrapManager::new(
            identity.node_id,
            cache.clone(),
            resolver,
            config.bootstrap_peers.clone(),
        );
        let punch = (config.enable_hole_punching && nat == NatType::PortRestricted).then(|| {
            Arc::new(
                PunchCoordinator::new(
                    transport.clone(),
                    StunClient::with_servers(config.stun_servers.clone()),
                    HolePunchConfig::default(),
                )
                .with_bind_addr(config.transport.bind_addr.clone()),
            )
        });
        let bootstrap_task = tokio::spawn(run_bootstrap(
            transport.clone(),
            bootstrap,
            cache.clone(),
            punch.clone(),
        ));

        let mut cleanup = tokio::time::interval(relay.cleanup_interval());
        cleanup.tick().await;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        warn!("Transport event stream closed");
                        break;
                    };
                    if let TransportEvent::PunchRequested { conn_id, from, endpoint, reply } = &event {
                        if let Some(coordinator) = &punch {
                            let (coordinator, conn_id, from, endpoint, reply) =
                                (coordinator.clone(), *conn_id, *from, endpoint.clone(), *reply);
                            tokio::spawn(async move {
                                if let Err(e) = coordinator.handle_request(conn_id, from, &endpoint, reply).await {
                                    debug!("Punch with {} failed: {}", from.short(), e);
                                }
                            });
                        }
                    }
                    if let TransportEvent::PeerAuthenticated(info) = &event {
                        if let (Some(node_id), Some(wallet), Some(addr)) =
                            (info.node_id, &info.wallet_address, &info.listen_addr)
                        {
                            cache.lock().record_success(
                                &PeerRecord {
                                    node_id,
                                    wallet_address: wallet.clone(),
                                    address: addr.clone(),
                                    last_seen: now_millis(),
                                },
                                now_millis(),
                            );
                        }
                    }
                    relay.handle_transport_event(event).await;
                }
                event = recv_hub(&mut hub_events) => {
                    match event {
                        Some(event) => relay.handle_hub_event(event).await,
                        None => hub_events = None,
                    }
                }
                _ = cleanup.tick() => {
                    relay.cleanup();
                }
                _ = &mut shutdown => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        bootstrap_task.abort();
        if let Err(e) = storage.flush().await {
            error!("Failed to flush relay storage: {}", e);
        }
        flusher.abort();
        transport.shutdown().await;
        if let Some(hub) = hub {
            hub.disconnect().await;
        }
        if let Err(e) = cache.lock().save() {
            warn!("Failed to save peer cache: {}", e);
        }

        let stats = storage.stats();
        info!(
            "Relay node stopped (stored {}, delivered {}, expired {})",
            stats.stored, stats.delivered, stats.expired
        );
        Ok(())
    }
}

/// Dial bootstrap candidates, then ask connected peers for more
async fn run_bootstrap(
    transport: P2PTransport,
    bootstrap: BootstrapManager,
    cache: Arc<Mutex<PeerCache>>,
    punch: Option<Arc<PunchCoordinator>>,
) {
    let candidates = bootstrap.bootstrap().await;
    let mut connected = 0usize;

    for candidate in candidates {
        match dial(&transport, &candidate, punch.as_deref()).await {
            Ok(()) => connected += 1,
            Err(e) => {
                debug!("Bootstrap {} failed: {}", candidate.address, e);
                if let Some(id) = candidate.node_id {
                    cache.lock().record_failure(&id);
                }
            }
        }
    }
    info!("Bootstrap connected to {} peers", connected);

    let self_id = transport.identity().node_id;
    for peer in transport.authenticated_peers() {
        let _ = transport.send_find_node(peer.conn_id, self_id).await;
    }
    if let Err(e) = cache.lock().save() {
        warn!("Failed to save peer cache: {}", e);
    }
}

/// Direct TCP dial, falling back to a relayed hole punch when the
/// candidate's node id is known
async fn dial(
    transport: &P2PTransport,
    candidate: &BootstrapCandidate,
    punch: Option<&PunchCoordinator>,
) -> mumblechat_network::Result<()> {
    let err = match transport.connect(&candidate.address).await {
        Ok(_) => return Ok(()),
        Err(e) => e,
    };
    let (Some(coordinator), Some(peer_id)) = (punch, candidate.node_id) else {
        return Err(err);
    };
    debug!("Direct dial to {} failed ({}); trying hole punch", candidate.address, err);
    match coordinator.connect(peer_id).await {
        Ok(info) => {
            info!("Hole punched to {} via {}", peer_id.short(), info.remote_addr);
            Ok(())
        }
        Err(e) => {
            debug!("Hole punch to {} failed: {}", peer_id.short(), e);
            Err(err)
        }
    }
}
