//! Node assembly.

use crate::config::NodeConfig;
use anyhow::Result;
use eosp2p_network::{Client, Envelope, Handler, PeerConfig, StaticChain};
use eosp2p_sync::IrreversibleSync;
use std::sync::Arc;
use tracing::{debug, info};

/// Logs every inbound packet.
struct PacketLogger;

impl Handler for PacketLogger {
    fn name(&self) -> &str {
        "packet-logger"
    }

    fn handle(&self, envelope: &Envelope) {
        debug!(
            addr = %envelope.sender.address(),
            kind = ?envelope.packet.kind,
            "Received packet"
        );
    }
}

/// A running node: the P2P client plus its sync collaborator.
#[derive(Clone)]
pub struct Node {
    client: Client,
    sync: Arc<IrreversibleSync>,
    peers: Vec<String>,
}

impl Node {
    /// Start the client. Peers are added by [`Node::run`].
    pub fn new(config: &NodeConfig) -> Result<Self> {
        let chain = Arc::new(StaticChain::genesis(config.chain_id()?));
        let sync = Arc::new(IrreversibleSync::new(config.sync_config(), chain.clone()));
        let client = Client::builder(config.client_config()?)
            .chain(chain)
            .sync(sync.clone())
            .start();

        info!(node_id = %client.node_id(), "P2P client ready");
        Ok(Self {
            client,
            sync,
            peers: config.peers.clone(),
        })
    }

    /// Register handlers, connect to the configured peers and run until
    /// shutdown.
    pub async fn run(&self) -> Result<()> {
        self.client.register_handler(Arc::new(PacketLogger)).await;

        for address in &self.peers {
            self.client.new_peer(PeerConfig::new(address.clone())).await?;
        }

        self.client.stopped().await;
        info!(state = ?self.sync.state(), "Sync state at exit");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.client.shutdown();
    }

    pub async fn stopped(&self) {
        self.client.stopped().await;
    }
}
