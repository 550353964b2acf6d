//! Irreversible-block sync collaborator.

use crate::{SyncError, SyncProgress, SyncResult, SYNC_BATCH_SIZE};
use eosp2p_network::{ChainView, Envelope, Message, MessageType, Peer, SyncControl, SyncHandler};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Synchronization state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// No sync peer.
    Idle,
    /// Sync peer chosen, its handshake not seen yet.
    AwaitingHandshake { peer: String },
    /// Requesting blocks.
    Syncing { peer: String, head: u32, target: u32 },
    /// Reached the sync peer's irreversible block.
    Synchronized { head: u32 },
}

/// Sync configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Blocks per sync request.
    pub batch_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: SYNC_BATCH_SIZE,
        }
    }
}

struct Session {
    peer: Peer,
    progress: SyncProgress,
}

/// Syncs up to the sync peer's last irreversible block.
///
/// The target comes from the peer's handshake. Blocks are requested in
/// batches with sync requests and counted as signed-block frames arrive;
/// their contents are not validated here.
pub struct IrreversibleSync {
    config: SyncConfig,
    chain: Arc<dyn ChainView>,
    session: Mutex<Option<Session>>,
    state: Mutex<SyncState>,
}

impl IrreversibleSync {
    pub fn new(config: SyncConfig, chain: Arc<dyn ChainView>) -> Self {
        Self {
            config,
            chain,
            session: Mutex::new(None),
            state: Mutex::new(SyncState::Idle),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state.lock().clone()
    }

    pub fn is_synced(&self) -> bool {
        matches!(self.state(), SyncState::Synchronized { .. })
    }

    /// Hand out the next batch, or report completion.
    fn advance(&self, session: &mut Option<Session>, control: &SyncControl) {
        let Some(active) = session.as_mut() else {
            return;
        };

        if active.progress.is_done() {
            let head = active.progress.head();
            info!(addr = %active.peer.address(), head, "Reached irreversible block");
            *self.state.lock() = SyncState::Synchronized { head };
            control.finished(&active.peer);
            *session = None;
            return;
        }

        if let (Some((start, end)), Some(target)) =
            (active.progress.next_request(), active.progress.target())
        {
            *self.state.lock() = SyncState::Syncing {
                peer: active.peer.address().to_string(),
                head: active.progress.head(),
                target,
            };
            let peer = active.peer.clone();
            tokio::spawn(async move {
                if let Err(e) = request_blocks(&peer, start, end).await {
                    warn!(addr = %peer.address(), error = %e, "Sync request failed");
                }
            });
        }
    }

    fn on_target(&self, session: &mut Option<Session>, lib_num: u32, control: &SyncControl) {
        if let Some(active) = session.as_mut() {
            debug!(addr = %active.peer.address(), lib = lib_num, "Sync target");
            active.progress.set_target(lib_num);
        }
        self.advance(session, control);
    }
}

impl SyncHandler for IrreversibleSync {
    fn handle(&self, envelope: &Envelope, control: &SyncControl) {
        let mut session = self.session.lock();
        let is_sync_peer = session
            .as_ref()
            .is_some_and(|s| s.peer == envelope.sender);
        if !is_sync_peer {
            return;
        }

        match &envelope.packet.message {
            Message::Handshake(handshake) => {
                self.on_target(&mut session, handshake.last_irreversible_block_num, control);
            }
            Message::Opaque {
                kind: MessageType::SignedBlock,
                ..
            } => {
                if let Some(active) = session.as_mut() {
                    active.progress.on_block();
                }
                self.advance(&mut session, control);
            }
            Message::GoAway(go_away) => {
                debug!(addr = %envelope.sender.address(), reason = %go_away.reason, "Sync peer going away");
            }
            _ => {}
        }
    }

    fn start_sync(&self, peer: &Peer, control: &SyncControl) {
        let mut session = self.session.lock();
        let mut progress = match session.take() {
            Some(previous) => previous.progress,
            None => SyncProgress::new(self.chain.head_block_num(), self.config.batch_size),
        };
        progress.reset_requests();

        info!(addr = %peer.address(), head = progress.head(), "Sync started");
        *session = Some(Session {
            peer: peer.clone(),
            progress,
        });

        match peer.remote_handshake() {
            Some(handshake) => {
                self.on_target(&mut session, handshake.last_irreversible_block_num, control);
            }
            None => {
                *self.state.lock() = SyncState::AwaitingHandshake {
                    peer: peer.address().to_string(),
                };
            }
        }
    }
}

async fn request_blocks(peer: &Peer, start: u32, end: u32) -> SyncResult<()> {
    if peer.is_closed() {
        return Err(SyncError::PeerClosed(peer.address().to_string()));
    }
    peer.send_sync_request(start, end).await?;
    Ok(())
}
