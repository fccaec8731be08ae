//! WolfLog - Quorum-Replicated Transaction Log
//!
//! Runs one node of a WolfLog cluster, either as the leader or as a
//! replica streaming the leader's log.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolflog::bus::Publisher;
use wolflog::checkpoint::Checkpoint;
use wolflog::config::WolfLogConfig;
use wolflog::epoch::EpochManager;
use wolflog::log::{ChunkDb, LogWriter};
use wolflog::node::{LeaderNode, ReplicaNode};
use wolflog::replication::ReplicationNode;
use wolflog::Error;

/// WolfLog - Quorum-Replicated Transaction Log
#[derive(Parser)]
#[command(name = "wolflog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolflog.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Leader,
    Replica,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WolfLog node
    Start {
        /// Role to run as; replica when a leader address is configured
        #[arg(long, value_enum)]
        role: Option<Role>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolflog.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,

        /// Leader address, for a replica configuration
        #[arg(long)]
        leader: Option<String>,
    },

    /// Validate configuration file
    Validate,

    /// Show node and log information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { role } => {
            let config = load_config(&cli.config)?;
            let level = cli
                .log_level
                .unwrap_or_else(|| config.logging.level.clone());
            init_logging(&level, &config.logging.format);
            run_start(config, role).await
        }
        Commands::Init {
            output,
            node_id,
            leader,
        } => run_init(output, node_id, leader),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "pretty");
            run_info(cli.config)
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: &PathBuf) -> anyhow::Result<WolfLogConfig> {
    WolfLogConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

/// Start the WolfLog node
async fn run_start(config: WolfLogConfig, role: Option<Role>) -> anyhow::Result<()> {
    let role = role.unwrap_or(if config.cluster.leader_address.is_some() {
        Role::Replica
    } else {
        Role::Leader
    });

    tracing::info!(
        "Starting WolfLog node {} as {:?} (cluster of {})",
        config.node.id,
        role,
        config.cluster.cluster_size
    );

    let mut node: Box<dyn ReplicationNode> = match role {
        Role::Leader => Box::new(LeaderNode::open(config)?),
        Role::Replica => Box::new(ReplicaNode::open(config)?),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    });

    match node.run(shutdown_rx).await {
        Ok(()) => {
            tracing::info!("WolfLog node {} stopped", node.instance_id());
            Ok(())
        }
        Err(Error::RestartRequired { position }) => {
            tracing::warn!(
                "Log diverged from the leader; restart to truncate at {}",
                position
            );
            Err(Error::RestartRequired { position }.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Write a sample configuration file
fn run_init(output: PathBuf, node_id: String, leader: Option<String>) -> anyhow::Result<()> {
    let leader_line = match &leader {
        Some(address) => format!("leader_address = \"{address}\""),
        None => "# leader_address = \"node-1.example.com:7655\"".to_string(),
    };

    let config_content = format!(
        r#"# WolfLog Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "0.0.0.0:7655"
data_dir = "/var/lib/wolflog/{node_id}"
# instance_id = "00000000-0000-0000-0000-000000000000"

[log]
chunk_size = 268435456
fsync = true

[cluster]
cluster_size = 3
{leader_line}
promotable = true

[epoch]
cache_size = 10

[replication]
bulk_size = 8192
send_window = 16777216
pump_interval_ms = 50
no_quorum_timeout_ms = 5000
connect_timeout_ms = 5000
reconnect_delay_ms = 500

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure storage and cluster settings.");
    println!("Then start with: wolflog --config {} start", output.display());

    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match WolfLogConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!(
                "  Leader: {}",
                config.cluster.leader_address.as_deref().unwrap_or("(this node)")
            );
            println!("  Cluster Size: {}", config.cluster.cluster_size);
            println!("  Quorum Size: {}", config.quorum_size());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

/// Show node and log information
fn run_info(config_path: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;

    println!("WolfLog Node Information");
    println!("========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Data Directory:   {}", config.data_dir().display());
    println!("Chunk Directory:  {}", config.chunk_dir().display());
    println!();
    println!("Cluster Configuration:");
    println!(
        "  Leader:         {}",
        config.cluster.leader_address.as_deref().unwrap_or("(this node)")
    );
    println!("  Cluster Size:   {}", config.cluster.cluster_size);
    println!("  Quorum Size:    {}", config.quorum_size());
    println!("  Promotable:     {}", config.cluster.promotable);

    let db = Arc::new(ChunkDb::from_config(&config)?);
    let checkpoints = db.checkpoints();
    println!();
    println!("Log:");
    println!("  Chunk Size:     {} bytes", db.chunk_size());
    println!("  Writer:         {}", checkpoints.writer.read());
    println!("  Epoch:          {}", checkpoints.epoch.read());
    println!("  Replication:    {}", checkpoints.replication.read());
    println!("  Truncate:       {}", checkpoints.truncate.read());

    let writer = LogWriter::open_shared(Arc::clone(&db))?;
    let mut epochs = EpochManager::new(
        Arc::clone(&db),
        writer,
        config.epoch.cache_size,
        config.instance_id(),
        Publisher::noop(),
    );
    epochs.init()?;

    println!();
    println!("Epochs (newest first):");
    let last_epochs = epochs.get_last_epochs(config.epoch.cache_size);
    if last_epochs.is_empty() {
        println!("  (none)");
    }
    for epoch in last_epochs {
        println!("  {}", epoch);
    }

    Ok(())
}
