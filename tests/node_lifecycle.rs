//! Operator lifecycle: configure an instance, register it, run it, stop it
//!
//! Run with: cargo test -p mumblechat-tests --test node_lifecycle

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mumblechat_core::{InstanceStatus, Tier};
use mumblechat_crypto::SigningKeypair;
use mumblechat_daemon::{
    instances, machine_id_hash, pid, FixedProbe, InstanceManager, InstanceManagerConfig,
    NodeConfig, NodeService, StorageManager,
};
use mumblechat_keystore::load_or_generate_identity;
use mumblechat_network::EndpointSource;
use mumblechat_registry::{RegisterNode, RegistryClient, RegistryConfig, RegistryError, RegistryResolver};
use mumblechat_settings::{HubMode, Settings};

fn test_root(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "mumblechat-it-{}-{}-{}",
        name,
        std::process::id(),
        rand::random::<u32>()
    ))
}

fn open_manager(root: &Path, total_mb: u64, free_mb: u64) -> InstanceManager {
    InstanceManager::open(
        InstanceManagerConfig {
            root: root.to_path_buf(),
            base_port: 19370,
            max_nodes: 3,
        },
        StorageManager::new(Arc::new(FixedProbe::from_mb(total_mb, free_mb)), root.to_path_buf()),
    )
    .unwrap()
}

#[tokio::test]
async fn instance_runs_and_reports_status() {
    let root = test_root("run");
    let mut manager = open_manager(&root, 50_000, 40_000);
    let instance = manager
        .add_node(SigningKeypair::generate(), Some(Tier::Silver), 5_000)
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::Stopped);

    let mut settings = Settings::default();
    settings.network.bind_addr = "127.0.0.1".to_string();
    settings.network.enable_hole_punching = false;
    settings.hub.enabled = HubMode::Never;

    // the key written by add_node is the node's identity
    let identity = load_or_generate_identity(&instances::key_path(&instance)).unwrap();
    assert_eq!(identity.wallet_address, instance.wallet_address);
    assert_eq!(identity.node_id, instance.node_id);

    let mut config = NodeConfig::for_instance(&settings, &instance, identity);
    config.transport.tcp_port = 0;
    config.transport.ws_port = None;

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(NodeService::new(config).run_until(async {
        let _ = stop_rx.await;
    }));

    let mut running = false;
    for _ in 0..50 {
        if pid::running_pid(&instance.data_path).is_some() {
            running = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(running, "PID file never appeared");

    manager.refresh_status().unwrap();
    assert_eq!(manager.get(&instance.wallet_address).unwrap().status, InstanceStatus::Running);
    // a running instance cannot be removed
    assert!(manager.remove_node(&instance.wallet_address, true).is_err());

    let _ = stop_tx.send(());
    handle.await.unwrap().unwrap();

    manager.refresh_status().unwrap();
    assert_eq!(manager.get(&instance.wallet_address).unwrap().status, InstanceStatus::Stopped);
    assert!(instances::store_path(&instance).exists());

    manager.remove_node(&instance.wallet_address, true).unwrap();
    assert!(!instance.data_path.exists());
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn registered_instance_becomes_bootstrap_candidate() {
    let root = test_root("register");
    let mut manager = open_manager(&root, 50_000, 40_000);
    let instance = manager
        .add_node(SigningKeypair::generate(), None, 1_024)
        .unwrap();
    assert_eq!(instance.tier, Tier::Bronze);

    let client = Arc::new(RegistryClient::new(RegistryConfig::mock(), &instance.wallet_address));
    let req = RegisterNode {
        node_id: instance.node_id,
        machine_id_hash: machine_id_hash(),
        storage_mb: instance.storage_mb,
        endpoint: format!("203.0.113.7:{}", instance.p2p_port),
    };

    // no stake approved yet
    let err = client.register_node_with_id(&req).await.unwrap_err();
    assert!(matches!(err, RegistryError::InsufficientStake { .. }));
    assert!(err.is_actionable());

    client.approve_stake(instance.tier.min_stake_units()).await.unwrap();
    client.register_node_with_id(&req).await.unwrap();
    manager.mark_registered(&instance.node_id.to_hex()).unwrap();
    assert!(manager.get(&instance.wallet_address).unwrap().registered);
    assert!(client.is_node_registered(&instance.node_id).await.unwrap());

    let resolver = RegistryResolver::new(client, Duration::from_secs(60));
    let peers = resolver.active_endpoints().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].node_id, instance.node_id);
    assert_eq!(peers[0].address, format!("203.0.113.7:{}", instance.p2p_port));

    // persisted across reopen
    let reopened = open_manager(&root, 50_000, 40_000);
    assert!(reopened.get(&instance.node_id.short()).unwrap().registered);
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn allocation_respects_disk_and_node_limits() {
    let root = test_root("alloc");
    // 10% of 10 GB is held back
    let mut manager = open_manager(&root, 10_000, 2_500);

    let err = manager
        .add_node(SigningKeypair::generate(), None, 2_048)
        .unwrap_err();
    assert!(err.is_actionable());
    assert!(manager.instances().is_empty());

    let a = manager.add_node(SigningKeypair::generate(), None, 1_024).unwrap();
    let info = manager.machine_info().unwrap();
    assert_eq!(info.node_count, 1);
    assert_eq!(info.allocated_mb, 1_024);
    assert!(info.available_for_new_nodes_mb < 1_500);

    let b = manager.add_node(SigningKeypair::generate(), None, 100).err();
    assert!(b.is_some(), "below the smallest tier");
    assert_eq!(a.ports(), [19370, 19371, 19380]);
    let _ = std::fs::remove_dir_all(&root);
}
