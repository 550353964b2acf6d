//! Peer lifecycle loop.
//!
//! The loop owns the peer table and the sync-peer selection. Peers are
//! added, deleted and restarted only from here, one mailbox message at a
//! time, so neither structure needs a lock.

use crate::dispatch::EnvelopeMsg;
use crate::handshake::ChainView;
use crate::mailbox::post;
use crate::peer::{PeerConfig, PeerContext};
use crate::{NetworkError, NetworkResult, Peer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle mailbox element.
pub(crate) enum PeerMsg {
    NewPeer(PeerConfig),
    DelPeer(PeerConfig),
    ErrPeer { peer: Peer, error: NetworkError },
    SyncFinished { peer: Peer },
    Snapshot(oneshot::Sender<LifecycleSnapshot>),
}

/// Connection state of a tracked peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Created or restarting, not yet connected.
    Init,
    /// Connected and handshaken.
    Normal,
    /// Explicitly deleted. Terminal.
    Closed,
}

struct PeerStatus {
    peer: Peer,
    state: PeerState,
    config: PeerConfig,
}

/// One row of the peer table.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub config: PeerConfig,
    pub state: PeerState,
    pub connected: bool,
}

/// Point-in-time view of the lifecycle loop's state.
#[derive(Debug, Clone, Default)]
pub struct LifecycleSnapshot {
    /// Sorted by address.
    pub peers: Vec<PeerSnapshot>,
    pub sync_peer: Option<String>,
    pub need_sync: bool,
}

impl LifecycleSnapshot {
    pub fn state_of(&self, address: &str) -> Option<PeerState> {
        self.peers
            .iter()
            .find(|p| p.config.address == address)
            .map(|p| p.state)
    }
}

pub(crate) struct PeerLifecycle {
    rx: mpsc::Receiver<PeerMsg>,
    /// Own mailbox, for failures that retry through ErrPeer.
    tx: mpsc::Sender<PeerMsg>,
    peers: HashMap<String, PeerStatus>,
    current_sync_peer: Option<Peer>,
    need_sync: bool,
    chain: Arc<dyn ChainView>,
    ctx: PeerContext,
    reconnect_delay: Duration,
    shutdown: CancellationToken,
}

impl PeerLifecycle {
    pub(crate) fn new(
        rx: mpsc::Receiver<PeerMsg>,
        tx: mpsc::Sender<PeerMsg>,
        chain: Arc<dyn ChainView>,
        ctx: PeerContext,
        need_sync: bool,
        reconnect_delay: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            rx,
            tx,
            peers: HashMap::new(),
            current_sync_peer: None,
            need_sync,
            chain,
            ctx,
            reconnect_delay,
            shutdown,
        }
    }

    /// Process events until shutdown. Queued events are abandoned; closing
    /// the transports is the dispatch loop's job.
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    match msg {
                        Some(msg) => self.on_message(msg).await,
                        None => break,
                    }
                }

                _ = self.shutdown.cancelled() => break,
            }
        }
        info!(pending = self.rx.len(), "Peer lifecycle loop stopped");
    }

    async fn on_message(&mut self, msg: PeerMsg) {
        match msg {
            PeerMsg::NewPeer(config) => self.on_new_peer(config).await,
            PeerMsg::DelPeer(config) => self.on_del_peer(&config).await,
            PeerMsg::ErrPeer { peer, error } => self.on_err_peer(peer, error).await,
            PeerMsg::SyncFinished { peer } => self.on_sync_finished(&peer),
            PeerMsg::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn on_new_peer(&mut self, config: PeerConfig) {
        if let Some(status) = self.peers.get(&config.address) {
            if status.state != PeerState::Closed {
                info!(addr = %config.address, state = ?status.state, "Peer already exists");
                return;
            }
            debug!(addr = %config.address, "Replacing closed peer");
        }

        info!(addr = %config.address, "New peer");
        let peer = Peer::new(config.clone(), &self.ctx, self.chain.handshake_info());
        let address = config.address.clone();
        self.peers.insert(
            address.clone(),
            PeerStatus {
                peer,
                state: PeerState::Init,
                config,
            },
        );

        // A failure is already queued as ErrPeer.
        let _ = self.start_peer(&address).await;
    }

    async fn on_del_peer(&mut self, config: &PeerConfig) {
        let Some(status) = self.peers.get_mut(&config.address) else {
            warn!(addr = %config.address, "No peer found to delete");
            return;
        };

        info!(addr = %config.address, "Deleting peer");
        status.state = PeerState::Closed;
        let peer = status.peer.clone();
        peer.close();
        peer.wait().await;

        if self.current_sync_peer.as_ref() == Some(&peer) {
            info!(addr = %config.address, "Sync peer deleted");
            self.current_sync_peer = None;
            self.rotate_sync_peer();
        }
    }

    async fn on_err_peer(&mut self, peer: Peer, error: NetworkError) {
        let address = peer.address().to_string();
        let Some(status) = self.peers.get_mut(&address) else {
            warn!(addr = %address, error = %error, "Error from unknown peer");
            return;
        };

        if status.state == PeerState::Closed {
            debug!(addr = %address, "Ignoring error from closed peer");
            return;
        }
        if status.peer != peer {
            debug!(addr = %address, "Ignoring error from replaced peer");
            return;
        }

        info!(addr = %address, error = %error, "Peer error, restarting");
        status.state = PeerState::Init;
        if self.current_sync_peer.as_ref() == Some(&peer) {
            info!(addr = %address, "Sync peer lost");
            self.current_sync_peer = None;
        }

        if self.start_peer(&address).await.is_err() {
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = self.shutdown.cancelled() => {}
            }
        }
    }

    fn on_sync_finished(&mut self, peer: &Peer) {
        info!(addr = %peer.address(), "Sync finished");
        self.current_sync_peer = None;
        self.need_sync = false;
    }

    /// Connect the peer tracked at `address`.
    ///
    /// On failure an ErrPeer is posted to this loop and the error returned.
    async fn start_peer(&mut self, address: &str) -> NetworkResult<()> {
        let Some(status) = self.peers.get(address) else {
            return Ok(());
        };
        let peer = status.peer.clone();

        if let Err(e) = peer.start().await {
            warn!(addr = %address, error = %e, "Peer start failed");
            post(
                &self.tx,
                PeerMsg::ErrPeer {
                    peer,
                    error: NetworkError::ConnectionFailed(format!("connect error: {}", e)),
                },
            );
            return Err(e);
        }

        if let Some(status) = self.peers.get_mut(address) {
            status.state = PeerState::Normal;
        }
        if self.need_sync && self.current_sync_peer.is_none() {
            self.start_sync(peer);
        }
        Ok(())
    }

    /// Pick an already connected peer after the sync peer went away.
    fn rotate_sync_peer(&mut self) {
        if !self.need_sync {
            return;
        }
        let next = self
            .peers
            .values()
            .filter(|s| s.state == PeerState::Normal)
            .min_by(|a, b| a.config.address.cmp(&b.config.address))
            .map(|s| s.peer.clone());
        if let Some(peer) = next {
            self.start_sync(peer);
        }
    }

    fn start_sync(&mut self, peer: Peer) {
        info!(addr = %peer.address(), "Selected sync peer");
        self.current_sync_peer = Some(peer.clone());
        post(&self.ctx.dispatch, EnvelopeMsg::StartSync { sender: peer });
    }

    fn snapshot(&self) -> LifecycleSnapshot {
        let mut peers: Vec<_> = self
            .peers
            .values()
            .map(|s| PeerSnapshot {
                config: s.config.clone(),
                state: s.state,
                connected: s.peer.is_connected(),
            })
            .collect();
        peers.sort_by(|a, b| a.config.address.cmp(&b.config.address));

        LifecycleSnapshot {
            peers,
            sync_peer: self
                .current_sync_peer
                .as_ref()
                .map(|p| p.address().to_string()),
            need_sync: self.need_sync,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, Dialer};
    use crate::handshake::{NullSigner, StaticChain};
    use crate::peer::PeerCloser;
    use crate::types::{Checksum256, NodeId};
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::DuplexStream;
    use tracing::Span;

    /// Hands out fresh in-memory streams, keeping the remote ends open.
    #[derive(Default)]
    struct TestDialer {
        fail: std::sync::atomic::AtomicBool,
        dials: AtomicUsize,
        remotes: Mutex<Vec<DuplexStream>>,
    }

    impl Dialer for TestDialer {
        fn dial(&self, address: &str) -> BoxFuture<'static, NetworkResult<Connection>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let result = if self.fail.load(Ordering::SeqCst) {
                Err(NetworkError::ConnectionFailed(format!("{} refused", address)))
            } else {
                let (local, remote) = tokio::io::duplex(64 * 1024);
                self.remotes.lock().push(remote);
                Ok(Box::new(local) as Connection)
            };
            Box::pin(async move { result })
        }
    }

    struct Fixture {
        lifecycle: PeerLifecycle,
        dispatch_rx: mpsc::Receiver<EnvelopeMsg>,
        dialer: Arc<TestDialer>,
    }

    fn fixture(need_sync: bool) -> Fixture {
        let dialer = Arc::new(TestDialer::default());
        let (dispatch_tx, dispatch_rx) = mpsc::channel(64);
        let (tx, rx) = mpsc::channel(64);
        let ctx = PeerContext {
            node_id: NodeId::random(),
            agent: "test".into(),
            p2p_address: "0.0.0.0:9876".into(),
            signer: Arc::new(NullSigner),
            dialer: dialer.clone(),
            dispatch: dispatch_tx,
            closer: PeerCloser::new(),
            close_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            span: Span::none(),
        };
        let chain = Arc::new(StaticChain::genesis(Checksum256([1u8; 32])));
        let lifecycle = PeerLifecycle::new(
            rx,
            tx,
            chain,
            ctx,
            need_sync,
            Duration::from_millis(10),
            CancellationToken::new(),
        );
        Fixture {
            lifecycle,
            dispatch_rx,
            dialer,
        }
    }

    fn start_syncs(rx: &mut mpsc::Receiver<EnvelopeMsg>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let EnvelopeMsg::StartSync { sender } = msg {
                out.push(sender.address().to_string());
            }
        }
        out
    }

    #[tokio::test]
    async fn test_first_normal_peer_becomes_sync_peer() {
        let mut f = fixture(true);
        f.lifecycle.on_new_peer(PeerConfig::new("a:1")).await;
        f.lifecycle.on_new_peer(PeerConfig::new("b:1")).await;

        let snapshot = f.lifecycle.snapshot();
        assert_eq!(snapshot.state_of("a:1"), Some(PeerState::Normal));
        assert_eq!(snapshot.state_of("b:1"), Some(PeerState::Normal));
        assert_eq!(snapshot.sync_peer.as_deref(), Some("a:1"));
        assert_eq!(start_syncs(&mut f.dispatch_rx), vec!["a:1"]);
    }

    #[tokio::test]
    async fn test_duplicate_new_peer_ignored() {
        let mut f = fixture(false);
        f.lifecycle.on_new_peer(PeerConfig::new("a:1")).await;
        f.lifecycle.on_new_peer(PeerConfig::new("a:1")).await;

        assert_eq!(f.lifecycle.peers.len(), 1);
        assert_eq!(f.dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_start_queues_err_peer() {
        let mut f = fixture(false);
        f.dialer.fail.store(true, Ordering::SeqCst);
        f.lifecycle.on_new_peer(PeerConfig::new("a:1")).await;

        assert_eq!(f.lifecycle.snapshot().state_of("a:1"), Some(PeerState::Init));
        match f.lifecycle.rx.try_recv() {
            Ok(PeerMsg::ErrPeer { peer, error }) => {
                assert_eq!(peer.address(), "a:1");
                assert!(error.to_string().contains("connect error"));
            }
            _ => panic!("expected a queued ErrPeer"),
        }
    }

    #[tokio::test]
    async fn test_err_after_delete_does_not_reconnect() {
        let mut f = fixture(false);
        f.lifecycle.on_new_peer(PeerConfig::new("a:1")).await;
        let stale = f.lifecycle.peers["a:1"].peer.clone();

        f.lifecycle.on_del_peer(&PeerConfig::new("a:1")).await;
        assert!(stale.is_closed());

        f.lifecycle
            .on_err_peer(stale, NetworkError::ConnectionClosed)
            .await;
        assert_eq!(f.dialer.dials.load(Ordering::SeqCst), 1);
        assert_eq!(f.lifecycle.snapshot().state_of("a:1"), Some(PeerState::Closed));
    }

    #[tokio::test]
    async fn test_new_peer_replaces_closed_entry() {
        let mut f = fixture(false);
        f.lifecycle.on_new_peer(PeerConfig::new("a:1")).await;
        let old = f.lifecycle.peers["a:1"].peer.clone();
        f.lifecycle.on_del_peer(&PeerConfig::new("a:1")).await;

        f.lifecycle.on_new_peer(PeerConfig::new("a:1")).await;
        let current = f.lifecycle.peers["a:1"].peer.clone();
        assert_ne!(old, current);
        assert_eq!(f.lifecycle.snapshot().state_of("a:1"), Some(PeerState::Normal));

        // An error from the old instance must not touch the new one.
        f.lifecycle.on_err_peer(old, NetworkError::ConnectionClosed).await;
        assert_eq!(f.dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_deleting_sync_peer_rotates() {
        let mut f = fixture(true);
        f.lifecycle.on_new_peer(PeerConfig::new("a:1")).await;
        f.lifecycle.on_new_peer(PeerConfig::new("b:1")).await;
        assert_eq!(start_syncs(&mut f.dispatch_rx), vec!["a:1"]);

        f.lifecycle.on_del_peer(&PeerConfig::new("a:1")).await;
        assert_eq!(f.lifecycle.snapshot().sync_peer.as_deref(), Some("b:1"));
        assert_eq!(start_syncs(&mut f.dispatch_rx), vec!["b:1"]);
    }

    #[tokio::test]
    async fn test_sync_finished_clears_selection() {
        let mut f = fixture(true);
        f.lifecycle.on_new_peer(PeerConfig::new("a:1")).await;
        let peer = f.lifecycle.peers["a:1"].peer.clone();

        f.lifecycle.on_sync_finished(&peer);
        let snapshot = f.lifecycle.snapshot();
        assert!(snapshot.sync_peer.is_none());
        assert!(!snapshot.need_sync);

        f.lifecycle.on_new_peer(PeerConfig::new("b:1")).await;
        assert!(f.lifecycle.snapshot().sync_peer.is_none());
    }

    #[tokio::test]
    async fn test_delete_unknown_is_noop() {
        let mut f = fixture(false);
        f.lifecycle.on_del_peer(&PeerConfig::new("nowhere:1")).await;
        assert!(f.lifecycle.peers.is_empty());
    }
}
