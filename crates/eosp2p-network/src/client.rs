//! Client entry surface.
//!
//! [`Client`] wires the two loops together and exposes the operations that
//! feed them. Every operation only enqueues work; results surface through
//! logging, handlers and [`Client::snapshot`].

use crate::connection::{ConnectionConfig, Dialer, TcpDialer};
use crate::dispatch::{EnvelopeMsg, PacketDispatcher};
use crate::handler::{Handler, NoSync, SyncControl, SyncHandler};
use crate::handshake::{ChainView, HandshakeSigner, NullSigner, StaticChain};
use crate::lifecycle::{LifecycleSnapshot, PeerLifecycle, PeerMsg};
use crate::peer::{PeerCloser, PeerConfig, PeerContext};
use crate::types::NodeId;
use crate::{NetworkError, NetworkResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, Instrument, Span};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Agent name announced in handshakes.
    pub agent: String,
    /// Address announced to peers as ours.
    pub p2p_address: String,
    /// Node identifier; random when unset.
    pub node_id: Option<NodeId>,
    /// Whether to pick a sync peer once one connects.
    pub need_sync: bool,
    /// Capacity of the packet dispatch mailbox.
    pub packet_mailbox: usize,
    /// Capacity of the peer lifecycle mailbox.
    pub peer_mailbox: usize,
    /// Wait before retrying a failed restart.
    pub reconnect_delay: Duration,
    /// Bound on waiting for a peer's transport to close.
    pub close_timeout: Duration,
    /// Bound on a single message write.
    pub write_timeout: Duration,
    /// Dial settings for the default TCP dialer.
    pub connection: ConnectionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            agent: "eosp2p-rs".to_string(),
            p2p_address: "0.0.0.0:9876".to_string(),
            node_id: None,
            need_sync: true,
            packet_mailbox: 1024,
            peer_mailbox: 64,
            reconnect_delay: Duration::from_secs(3),
            close_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Assembles a [`Client`] from its collaborators.
pub struct ClientBuilder {
    config: ClientConfig,
    chain: Option<Arc<dyn ChainView>>,
    sync: Arc<dyn SyncHandler>,
    dialer: Option<Arc<dyn Dialer>>,
    signer: Arc<dyn HandshakeSigner>,
    span: Option<Span>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            chain: None,
            sync: Arc::new(NoSync),
            dialer: None,
            signer: Arc::new(NullSigner),
            span: None,
        }
    }

    /// Source of handshake seed data. Defaults to a chain at genesis.
    pub fn chain(mut self, chain: Arc<dyn ChainView>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn sync(mut self, sync: Arc<dyn SyncHandler>) -> Self {
        self.sync = sync;
        self
    }

    /// Transport factory. Defaults to TCP.
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn signer(mut self, signer: Arc<dyn HandshakeSigner>) -> Self {
        self.signer = signer;
        self
    }

    /// Parent span for every event the client emits.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Spawn both loops. Must be called within a tokio runtime.
    pub fn start(self) -> Client {
        let config = self.config;
        let node_id = config.node_id.unwrap_or_else(NodeId::random);
        let span = self
            .span
            .unwrap_or_else(|| tracing::info_span!("p2p", node = %node_id));
        let chain = self
            .chain
            .unwrap_or_else(|| Arc::new(StaticChain::default()) as Arc<dyn ChainView>);
        let dialer = self
            .dialer
            .unwrap_or_else(|| Arc::new(TcpDialer::new(config.connection.clone())) as Arc<dyn Dialer>);

        let (packet_tx, packet_rx) = mpsc::channel(config.packet_mailbox.max(1));
        let (peer_tx, peer_rx) = mpsc::channel(config.peer_mailbox.max(1));
        let shutdown = CancellationToken::new();
        let closer = PeerCloser::new();

        let ctx = PeerContext {
            node_id,
            agent: config.agent.clone(),
            p2p_address: config.p2p_address.clone(),
            signer: self.signer,
            dialer,
            dispatch: packet_tx.clone(),
            closer: closer.clone(),
            close_timeout: config.close_timeout,
            write_timeout: config.write_timeout,
            span: span.clone(),
        };

        let dispatcher = PacketDispatcher::new(
            packet_rx,
            self.sync,
            SyncControl::new(packet_tx.clone()),
            peer_tx.clone(),
            closer,
            config.close_timeout,
            shutdown.clone(),
        );
        let lifecycle = PeerLifecycle::new(
            peer_rx,
            peer_tx.clone(),
            chain,
            ctx,
            config.need_sync,
            config.reconnect_delay,
            shutdown.clone(),
        );

        let tasks = TaskTracker::new();
        tasks.spawn(
            dispatcher
                .run()
                .instrument(tracing::info_span!(parent: &span, "dispatch")),
        );
        tasks.spawn(
            lifecycle
                .run()
                .instrument(tracing::info_span!(parent: &span, "lifecycle")),
        );
        tasks.close();

        info!(parent: &span, agent = %config.agent, "P2P client started");
        Client {
            node_id,
            packet_tx,
            peer_tx,
            shutdown,
            tasks,
            span,
        }
    }
}

/// Handle to a running P2P client.
#[derive(Clone)]
pub struct Client {
    node_id: NodeId,
    packet_tx: mpsc::Sender<EnvelopeMsg>,
    peer_tx: mpsc::Sender<PeerMsg>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    span: Span,
}

impl Client {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Start a client with the given collaborators and the null signer.
    pub fn start(
        config: ClientConfig,
        chain: Arc<dyn ChainView>,
        sync: Arc<dyn SyncHandler>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        ClientBuilder::new(config)
            .chain(chain)
            .sync(sync)
            .dialer(dialer)
            .start()
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Add a handler, or replace the one with the same name in place.
    pub async fn register_handler(&self, handler: Arc<dyn Handler>) {
        self.send_packet_msg(EnvelopeMsg::AddHandler(handler)).await;
    }

    /// Remove the handler with this name, if any.
    pub async fn unregister_handler(&self, name: &str) {
        self.send_packet_msg(EnvelopeMsg::DelHandler(name.to_string()))
            .await;
    }

    /// Request a connection to a new peer.
    ///
    /// Always succeeds; connect failures are retried in the background.
    pub async fn new_peer(&self, config: PeerConfig) -> NetworkResult<()> {
        self.send_peer_msg(PeerMsg::NewPeer(config)).await;
        Ok(())
    }

    /// Request the peer at `address` be closed and never reconnected.
    pub async fn del_peer_by_address(&self, address: &str) -> NetworkResult<()> {
        self.send_peer_msg(PeerMsg::DelPeer(PeerConfig::new(address)))
            .await;
        Ok(())
    }

    /// Current peer table and sync selection.
    pub async fn snapshot(&self) -> NetworkResult<LifecycleSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.peer_tx
            .send(PeerMsg::Snapshot(reply))
            .await
            .map_err(|_| NetworkError::MailboxClosed)?;
        rx.await.map_err(|_| NetworkError::MailboxClosed)
    }

    /// Signal both loops to stop. Peers are closed by the dispatch loop.
    pub fn shutdown(&self) {
        info!(parent: &self.span, "P2P client shutdown requested");
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait until both loops have exited.
    pub async fn stopped(&self) {
        self.tasks.wait().await;
    }

    async fn send_packet_msg(&self, msg: EnvelopeMsg) {
        if self.packet_tx.send(msg).await.is_err() {
            debug!(parent: &self.span, "Dispatch mailbox closed");
        }
    }

    async fn send_peer_msg(&self, msg: PeerMsg) {
        if self.peer_tx.send(msg).await.is_err() {
            debug!(parent: &self.span, "Peer mailbox closed");
        }
    }
}
