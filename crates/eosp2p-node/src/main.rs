//! eosp2p-node - a standalone peer-to-peer node for EOSIO-protocol chains.
//!
//! Connects to the configured peers, syncs up to the first sync peer's
//! irreversible block and logs every packet it receives.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod config;
mod node;

use config::NodeConfig;
use node::Node;

/// Standalone EOSIO P2P node.
#[derive(Parser, Debug)]
#[command(name = "eosp2p-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "eosp2p-node.toml")]
    config: PathBuf,

    /// Peer address to connect to (repeatable)
    #[arg(short, long = "peer")]
    peers: Vec<String>,

    /// Chain id (hex)
    #[arg(long)]
    chain_id: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting eosp2p-node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load(&args.config, &args)?;

    info!("Chain: {}", config.chain_id);
    info!("Agent: {}", config.agent);
    info!("Peers: {}", config.peers.join(", "));

    let node = Node::new(&config)?;

    let node_handle = node.clone();
    let shutdown_signal = async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        node_handle.shutdown();
    };

    tokio::select! {
        result = node.run() => {
            if let Err(e) = result {
                tracing::error!("Node error: {}", e);
            }
        }
        _ = shutdown_signal => {
            node.stopped().await;
            info!("Shutdown complete");
        }
    }

    info!("eosp2p-node stopped");
    Ok(())
}
