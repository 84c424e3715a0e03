//! MumbleChat relay daemon
//!
//! Runs a single relay node from `settings.json`. With an instance id as
//! the only argument, runs that configured instance instead.

use mumblechat_daemon::{
    instances, DaemonError, InstanceManager, InstanceManagerConfig, NodeConfig, NodeService,
    StorageManager,
};
use mumblechat_keystore::{expand_path, load_or_generate_identity};
use mumblechat_logging::LogLevel;
use mumblechat_settings::Settings;

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    let settings = Settings::load_or_default()?;
    let root = settings
        .node
        .data_dir
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(|| settings.config_dir());

    let config = match std::env::args().nth(1) {
        Some(id) => {
            let manager = InstanceManager::open(
                InstanceManagerConfig {
                    root: root.clone(),
                    base_port: settings.node.base_port,
                    max_nodes: settings.node.max_nodes_per_machine,
                },
                StorageManager::system(root),
            )?;
            let instance = manager
                .get(&id)
                .cloned()
                .ok_or_else(|| mumblechat_daemon::NodeManagerError::NotFound(id.clone()))?;
            if let Err(e) = mumblechat_logging::try_init_with_file(LogLevel::Debug, &instances::log_path(&instance)) {
                eprintln!("logging: {}", e);
            }
            let identity = load_or_generate_identity(&instances::key_path(&instance))?;
            NodeConfig::for_instance(&settings, &instance, identity)
        }
        None => {
            mumblechat_logging::init(LogLevel::Debug);
            let key_path = settings
                .node
                .keyfile
                .as_deref()
                .map(expand_path)
                .unwrap_or_else(|| root.join("keys").join("node.key"));
            let identity = load_or_generate_identity(&key_path)?;
            NodeConfig::from_settings(&settings, identity, &root)
        }
    };

    tracing::info!("Starting MumbleChat relay daemon...");
    if let Err(e) = NodeService::new(config).run().await {
        tracing::error!("Relay node failed: {}", e);
        return Err(e);
    }
    tracing::info!("Daemon stopped");
    Ok(())
}
