//! MumbleChat CLI
//!
//! Command-line interface for relay node operators.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use mumblechat_core::{InstanceStatus, NodeInstance, Tier};
use mumblechat_crypto::SigningKeypair;
use mumblechat_daemon::{
    instances, machine_id_hash, pid, InstanceManager, InstanceManagerConfig, NodeConfig,
    NodeManagerError, NodeService, StorageManager,
};
use mumblechat_keystore::{expand_path, load_or_generate_identity};
use mumblechat_logging::LogLevel;
use mumblechat_network::StunClient;
use mumblechat_registry::{RegisterNode, RegistryClient, RegistryConfig, RegistryError, RegistryMode};
use mumblechat_settings::{RegistryMode as SettingsRegistryMode, Settings};

/// MumbleChat - Decentralized encrypted messaging relay
#[derive(Parser)]
#[command(name = "mumblechat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to ~/.mumblechat/settings.json)
    #[arg(long)]
    config: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show machine, disk and tier summary
    Info,

    /// List configured relay instances
    List,

    /// Configure a new relay instance
    Add {
        /// Storage to allocate in MB (prompted when omitted)
        #[arg(short, long)]
        storage_mb: Option<u64>,

        /// Tier (BRONZE, SILVER, GOLD, PLATINUM); derived from storage when omitted
        #[arg(short, long)]
        tier: Option<Tier>,
    },

    /// Remove a stopped relay instance
    Remove {
        /// Node id (prefix) or wallet address
        id: String,

        /// Also delete the instance's data directory
        #[arg(long)]
        purge: bool,
    },

    /// Register an instance on-chain
    Register {
        /// Node id (prefix) or wallet address; optional with a single instance
        id: Option<String>,

        /// Public `host:port` to advertise (STUN-discovered when omitted)
        #[arg(long)]
        endpoint: Option<String>,

        /// Approve the tier's minimum stake before registering
        #[arg(long)]
        approve: bool,
    },

    /// Run an instance in the foreground
    Start {
        /// Node id (prefix) or wallet address
        id: String,
    },

    /// Stop a running instance
    Stop {
        /// Node id (prefix) or wallet address
        id: String,
    },

    /// Discover the public address and classify the NAT
    Nat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(&expand_path(path)),
        None => Settings::load_or_default(),
    }
    .context("failed to load settings")?;

    // `start` logs to the instance log file as well; everything else to stderr
    if !matches!(cli.command, Commands::Start { .. }) {
        mumblechat_logging::init(LogLevel::from_verbosity(cli.verbose));
    }

    let result = match cli.command {
        Commands::Info => show_info(&settings),
        Commands::List => list_nodes(&settings),
        Commands::Add { storage_mb, tier } => add_node(&settings, storage_mb, tier),
        Commands::Remove { id, purge } => remove_node(&settings, &id, purge),
        Commands::Register {
            id,
            endpoint,
            approve,
        } => register(&settings, id, endpoint, approve).await,
        Commands::Start { id } => start_node(&settings, &id, cli.verbose).await,
        Commands::Stop { id } => stop_node(&settings, &id).await,
        Commands::Nat => detect_nat(&settings).await,
    };

    if let Err(e) = &result {
        if let Some(hint) = actionable_hint(e) {
            eprintln!("{}", hint);
        }
    }
    result
}

/// Extra guidance for failures the operator can fix
fn actionable_hint(err: &anyhow::Error) -> Option<String> {
    if let Some(e) = err.downcast_ref::<NodeManagerError>() {
        if e.is_actionable() {
            return Some(format!("Action required: {}", e));
        }
    }
    if let Some(e) = err.downcast_ref::<RegistryError>() {
        if e.is_actionable() {
            return Some(format!(
                "Action required: {} (use `register --approve` to approve the stake)",
                e
            ));
        }
    }
    None
}

fn data_root(settings: &Settings) -> PathBuf {
    settings
        .node
        .data_dir
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(|| settings.config_dir())
}

fn open_manager(settings: &Settings) -> Result<InstanceManager> {
    let root = data_root(settings);
    let mut manager = InstanceManager::open(
        InstanceManagerConfig {
            root: root.clone(),
            base_port: settings.node.base_port,
            max_nodes: settings.node.max_nodes_per_machine,
        },
        StorageManager::system(root),
    )
    .context("failed to open instance list")?;
    manager.refresh_status()?;
    Ok(manager)
}

fn find_instance(manager: &InstanceManager, id: &str) -> Result<NodeInstance> {
    manager
        .get(id)
        .cloned()
        .ok_or_else(|| NodeManagerError::NotFound(id.to_string()).into())
}

// ============================================================================
// Machine & Instances
// ============================================================================

fn show_info(settings: &Settings) -> Result<()> {
    let manager = open_manager(settings)?;
    let info = manager.machine_info()?;

    println!("MumbleChat Relay Host");
    println!("=====================");
    println!("Machine ID:      {}", info.machine_id);
    println!("Disk total:      {} MB", info.disk_total_mb);
    println!("Disk free:       {} MB", info.disk_free_mb);
    println!("Safety buffer:   {} MB", info.safety_buffer_mb);
    println!("Allocated:       {} MB across {} nodes", info.allocated_mb, info.node_count);
    println!("Used:            {} MB", info.used_mb);
    println!("Available:       {} MB", info.available_for_new_nodes_mb);
    match info.recommended_tier {
        Some(tier) => println!(
            "Recommended:     {} (stake {} MCT, {}x rewards)",
            tier,
            tier.min_stake_tokens(),
            tier.reward_multiplier()
        ),
        None => println!("Recommended:     none (less than {} MB available)", Tier::Bronze.min_storage_mb()),
    }
    println!(
        "Nodes:           {}/{}",
        info.node_count, settings.node.max_nodes_per_machine
    );
    Ok(())
}

fn list_nodes(settings: &Settings) -> Result<()> {
    let manager = open_manager(settings)?;
    if manager.instances().is_empty() {
        println!("No relay instances configured. Use `mumblechat add` to create one.");
        return Ok(());
    }

    println!(
        "{:<14} {:<44} {:<9} {:>8} {:<17} {:<8} {}",
        "NODE", "WALLET", "TIER", "MB", "PORTS", "STATUS", "REGISTERED"
    );
    for n in manager.instances() {
        println!(
            "{:<14} {:<44} {:<9} {:>8} {:<17} {:<8} {}",
            n.node_id.short(),
            n.wallet_address,
            n.tier.to_string(),
            n.storage_mb,
            format!("{}/{}/{}", n.p2p_port, n.ws_port, n.api_port),
            status_label(n.status),
            if n.registered { "yes" } else { "no" }
        );
    }
    Ok(())
}

fn status_label(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Running => "running",
        InstanceStatus::Stopped => "stopped",
        InstanceStatus::Error => "error",
    }
}

fn prompt_storage(default_mb: u64) -> Result<u64> {
    print!("Storage to allocate in MB [{}]: ", default_mb);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let line = line.trim();
    if line.is_empty() {
        return Ok(default_mb);
    }
    line.parse()
        .with_context(|| format!("not a number of megabytes: {}", line))
}

fn add_node(settings: &Settings, storage_mb: Option<u64>, tier: Option<Tier>) -> Result<()> {
    let mut manager = open_manager(settings)?;

    let storage_mb = match storage_mb {
        Some(mb) => mb,
        None => {
            let info = manager.machine_info()?;
            println!(
                "{} MB available for new nodes (recommended tier: {})",
                info.available_for_new_nodes_mb,
                info.recommended_tier
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "none".to_string())
            );
            let default_mb = tier
                .or(settings.node.tier)
                .map(|t| t.min_storage_mb())
                .unwrap_or(settings.node.storage_mb);
            prompt_storage(default_mb)?
        }
    };

    let instance = manager.add_node(SigningKeypair::generate(), tier.or(settings.node.tier), storage_mb)?;

    println!("Added relay node");
    println!("  Node ID: {}", instance.node_id);
    println!("  Wallet:  {}", instance.wallet_address);
    println!("  Tier:    {} ({} MB)", instance.tier, instance.storage_mb);
    println!(
        "  Ports:   p2p {} / ws {} / api {}",
        instance.p2p_port, instance.ws_port, instance.api_port
    );
    println!("  Data:    {}", instance.data_path.display());
    println!();
    println!("Next: fund the wallet with {} MCT and run `mumblechat register {}`",
        instance.tier.min_stake_tokens(),
        instance.node_id.short()
    );
    Ok(())
}

fn remove_node(settings: &Settings, id: &str, purge: bool) -> Result<()> {
    let mut manager = open_manager(settings)?;
    let removed = manager.remove_node(id, purge)?;
    println!("Removed node {}", removed.node_id.short());
    if !purge {
        println!("Data kept in {}", removed.data_path.display());
    }
    Ok(())
}

// ============================================================================
// Registry
// ============================================================================

fn registry_config(settings: &Settings) -> RegistryConfig {
    let r = &settings.registry;
    match r.mode {
        SettingsRegistryMode::Mock => RegistryConfig::mock(),
        SettingsRegistryMode::Live => RegistryConfig {
            mode: RegistryMode::Live,
            rpc_url: r.rpc_url.clone(),
            registry_address: r.registry_address.clone(),
            token_address: r.token_address.clone(),
        },
    }
}

async fn public_endpoint(settings: &Settings, port: u16) -> Result<String> {
    let stun = StunClient::with_servers(settings.network.stun_servers.clone());
    let mapping = stun
        .discover_public_address(None)
        .await
        .context("could not discover a public address; pass --endpoint")?;
    Ok(format!("{}:{}", mapping.public_addr.ip(), port))
}

async fn register(
    settings: &Settings,
    id: Option<String>,
    endpoint: Option<String>,
    approve: bool,
) -> Result<()> {
    let mut manager = open_manager(settings)?;
    let instance = match id {
        Some(id) => find_instance(&manager, &id)?,
        None => match manager.instances() {
            [only] => only.clone(),
            [] => bail!("no relay instances configured; run `mumblechat add` first"),
            _ => bail!("several instances configured; pass a node id"),
        },
    };

    let identity = load_or_generate_identity(&instances::key_path(&instance))
        .context("failed to load node key")?;
    let endpoint = match endpoint {
        Some(e) => e,
        None => public_endpoint(settings, instance.p2p_port).await?,
    };

    let client = Arc::new(RegistryClient::new(registry_config(settings), &identity.wallet_address));
    if client.is_mock() {
        println!("Registry is in mock mode; nothing is submitted on-chain");
    }

    if let Some(record) = client.nodes(&instance.node_id).await? {
        manager.mark_registered(&instance.node_id.to_hex())?;
        let tier = record.tier.map(|t| t.to_string()).unwrap_or_else(|| "unknown tier".to_string());
        println!(
            "Node {} is already registered at {} ({}, {})",
            instance.node_id.short(),
            record.endpoint,
            tier,
            if record.is_active { "active" } else { "inactive" }
        );
        return Ok(());
    }

    if approve {
        let amount = instance.tier.min_stake_units();
        let tx = client.approve_stake(amount).await?;
        println!("Approved {} MCT stake ({})", instance.tier.min_stake_tokens(), tx);
    }

    info!("Registering {} at {}", instance.node_id.short(), endpoint);
    let tx = client
        .register_node_with_id(&RegisterNode {
            node_id: instance.node_id,
            machine_id_hash: machine_id_hash(),
            storage_mb: instance.storage_mb,
            endpoint: endpoint.clone(),
        })
        .await?;
    manager.mark_registered(&instance.node_id.to_hex())?;

    println!("Registered node {} at {}", instance.node_id.short(), endpoint);
    println!("Transaction: {}", tx);
    println!("It may take a moment before the node is listed as active.");
    Ok(())
}

// ============================================================================
// Run / Stop
// ============================================================================

async fn start_node(settings: &Settings, id: &str, verbose: u8) -> Result<()> {
    let mut manager = open_manager(settings)?;
    let instance = find_instance(&manager, id)?;
    if let Some(pid) = pid::running_pid(&instance.data_path) {
        bail!("node {} is already running (pid {})", instance.node_id.short(), pid);
    }

    let level = match verbose {
        0 => LogLevel::Debug,
        n => LogLevel::from_verbosity(n + 1),
    };
    mumblechat_logging::try_init_with_file(level, &instances::log_path(&instance))
        .map_err(|e| anyhow!("failed to initialise logging: {}", e))?;

    let identity = load_or_generate_identity(&instances::key_path(&instance))
        .context("failed to load node key")?;
    let config = NodeConfig::for_instance(settings, &instance, identity);

    println!(
        "Starting node {} on port {} (ctrl-c to stop)",
        instance.node_id.short(),
        instance.p2p_port
    );
    let result = NodeService::new(config).run().await;

    let status = if result.is_ok() {
        InstanceStatus::Stopped
    } else {
        InstanceStatus::Error
    };
    manager.set_status(&instance.node_id.to_hex(), status)?;
    result.with_context(|| format!("node {} failed", instance.node_id.short()))
}

async fn stop_node(settings: &Settings, id: &str) -> Result<()> {
    let manager = open_manager(settings)?;
    let instance = find_instance(&manager, id)?;
    let Some(pid) = pid::running_pid(&instance.data_path) else {
        println!("Node {} is not running", instance.node_id.short());
        return Ok(());
    };

    pid::terminate(pid).with_context(|| format!("failed to signal pid {}", pid))?;
    for _ in 0..100 {
        if pid::running_pid(&instance.data_path).is_none() {
            println!("Stopped node {}", instance.node_id.short());
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    bail!("node {} did not stop within 10s (pid {})", instance.node_id.short(), pid)
}

async fn detect_nat(settings: &Settings) -> Result<()> {
    let stun = StunClient::with_servers(settings.network.stun_servers.clone());
    match stun.discover_public_address(None).await {
        Ok(mapping) => println!("Public address: {} (via {})", mapping.public_addr, mapping.server),
        Err(e) => println!("Public address: unknown ({})", e),
    }
    let nat = stun.detect_nat_type().await;
    println!("NAT type:       {}", nat);
    println!(
        "Direct inbound: {}",
        if nat.is_directly_reachable() {
            "likely"
        } else {
            "unlikely; the hub tunnel will be used"
        }
    );
    Ok(())
}
