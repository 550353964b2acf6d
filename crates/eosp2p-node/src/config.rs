//! Node configuration.

use crate::Args;
use anyhow::{Context, Result};
use eosp2p_network::{Checksum256, ClientConfig, ConnectionConfig, NodeId};
use eosp2p_sync::{SyncConfig, SYNC_BATCH_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// EOS mainnet chain id.
pub const MAINNET_CHAIN_ID: &str =
    "aca376f206b8fc25a6ed44dbdc66547c36c6c33e3a119ffbeaef943642f0e906";

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Agent name announced in handshakes.
    pub agent: String,
    /// Address announced to peers as ours.
    pub p2p_address: String,
    /// Chain id (hex).
    pub chain_id: String,
    /// Node id (hex). Random when unset.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Peers to connect to at startup.
    #[serde(default)]
    pub peers: Vec<String>,
    /// Client loop settings.
    #[serde(default)]
    pub client: ClientSection,
    /// Sync settings.
    #[serde(default)]
    pub sync: SyncSection,
}

/// Client loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Sync from the first connected peer.
    pub need_sync: bool,
    /// Dispatch mailbox capacity.
    pub packet_mailbox: usize,
    /// Lifecycle mailbox capacity.
    pub peer_mailbox: usize,
    /// Delay before retrying a failed reconnect, in seconds.
    pub reconnect_delay_secs: u64,
    /// Bound on waiting for a peer to close, in seconds.
    pub close_timeout_secs: u64,
    /// TCP connect timeout, in seconds.
    pub connect_timeout_secs: u64,
    /// Bound on a single message write, in seconds.
    pub write_timeout_secs: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        let client = ClientConfig::default();
        Self {
            need_sync: client.need_sync,
            packet_mailbox: client.packet_mailbox,
            peer_mailbox: client.peer_mailbox,
            reconnect_delay_secs: client.reconnect_delay.as_secs(),
            close_timeout_secs: client.close_timeout.as_secs(),
            connect_timeout_secs: client.connection.connect_timeout.as_secs(),
            write_timeout_secs: client.write_timeout.as_secs(),
        }
    }
}

/// Sync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// Blocks per sync request.
    pub batch_size: u32,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            batch_size: SYNC_BATCH_SIZE,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            agent: format!("eosp2p-node/{}", env!("CARGO_PKG_VERSION")),
            p2p_address: format!("0.0.0.0:{}", eosp2p_network::DEFAULT_PORT),
            chain_id: MAINNET_CHAIN_ID.to_string(),
            node_id: None,
            peers: Vec::new(),
            client: ClientSection::default(),
            sync: SyncSection::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default()
        };

        // CLI peers are added to the configured ones
        for peer in &args.peers {
            if !config.peers.contains(peer) {
                config.peers.push(peer.clone());
            }
        }
        if let Some(ref chain_id) = args.chain_id {
            config.chain_id = chain_id.clone();
        }

        config.chain_id().context("Invalid chain id")?;
        Ok(config)
    }

    pub fn chain_id(&self) -> Result<Checksum256> {
        self.chain_id
            .parse()
            .with_context(|| format!("chain id {}", self.chain_id))
    }

    /// Map onto the network client's configuration.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let node_id = match &self.node_id {
            Some(id) => Some(
                id.parse::<NodeId>()
                    .with_context(|| format!("node id {}", id))?,
            ),
            None => None,
        };

        Ok(ClientConfig {
            agent: self.agent.clone(),
            p2p_address: self.p2p_address.clone(),
            node_id,
            need_sync: self.client.need_sync,
            packet_mailbox: self.client.packet_mailbox,
            peer_mailbox: self.client.peer_mailbox,
            reconnect_delay: Duration::from_secs(self.client.reconnect_delay_secs),
            close_timeout: Duration::from_secs(self.client.close_timeout_secs),
            write_timeout: Duration::from_secs(self.client.write_timeout_secs),
            connection: ConnectionConfig {
                connect_timeout: Duration::from_secs(self.client.connect_timeout_secs),
                ..Default::default()
            },
        })
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            batch_size: self.sync.batch_size,
        }
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn args(peers: &[&str], chain_id: Option<&str>) -> Args {
        Args {
            config: PathBuf::from("unused.toml"),
            peers: peers.iter().map(|p| p.to_string()).collect(),
            chain_id: chain_id.map(str::to_string),
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.chain_id, MAINNET_CHAIN_ID);
        assert!(config.chain_id().is_ok());

        let client = config.client_config().unwrap();
        assert!(client.need_sync);
        assert_eq!(client.reconnect_delay, Duration::from_secs(3));
    }

    #[test]
    fn test_missing_file_uses_defaults_and_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let config = NodeConfig::load(&path, &args(&["127.0.0.1:9876"], None)).unwrap();
        assert_eq!(config.peers, vec!["127.0.0.1:9876"]);
        assert_eq!(config.chain_id, MAINNET_CHAIN_ID);
    }

    #[test]
    fn test_load_from_file_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let chain = "11".repeat(32);
        std::fs::write(
            &path,
            r#"
agent = "test-agent"
p2p_address = "10.0.0.1:9876"
chain_id = "aca376f206b8fc25a6ed44dbdc66547c36c6c33e3a119ffbeaef943642f0e906"
peers = ["10.0.0.2:9876"]

[client]
need_sync = false
reconnect_delay_secs = 7
write_timeout_secs = 2
"#,
        )
        .unwrap();

        let config = NodeConfig::load(&path, &args(&["10.0.0.3:9876", "10.0.0.2:9876"], Some(&chain)))
            .unwrap();
        assert_eq!(config.agent, "test-agent");
        assert_eq!(config.peers, vec!["10.0.0.2:9876", "10.0.0.3:9876"]);
        assert_eq!(config.chain_id, chain);

        let client = config.client_config().unwrap();
        assert!(!client.need_sync);
        assert_eq!(client.reconnect_delay, Duration::from_secs(7));
        assert_eq!(client.write_timeout, Duration::from_secs(2));
        // Unset fields in a section keep their defaults
        assert_eq!(client.peer_mailbox, ClientConfig::default().peer_mailbox);
    }

    #[test]
    fn test_invalid_chain_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(NodeConfig::load(&path, &args(&[], Some("not-hex"))).is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.toml");
        let mut config = NodeConfig::default();
        config.peers.push("10.0.0.9:9876".to_string());
        config.node_id = Some("22".repeat(32));
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path, &args(&[], None)).unwrap();
        assert_eq!(loaded.peers, config.peers);
        let client = loaded.client_config().unwrap();
        assert_eq!(client.node_id, Some(Checksum256([0x22; 32])));
    }
}
