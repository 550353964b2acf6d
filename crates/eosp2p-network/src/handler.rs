//! Packet consumers.

use crate::dispatch::EnvelopeMsg;
use crate::mailbox::post;
use crate::{Packet, Peer};
use tokio::sync::mpsc;

/// A decoded packet paired with the peer it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: Peer,
    pub packet: Packet,
}

impl Envelope {
    pub fn new(sender: Peer, packet: Packet) -> Self {
        Self { sender, packet }
    }
}

/// Consumer of every inbound envelope, identified by name.
///
/// `handle` runs on the dispatch loop. It must not block; work that needs to
/// await (such as replying to the sender) belongs on a spawned task.
pub trait Handler: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn handle(&self, envelope: &Envelope);
}

/// The component driving block synchronization.
///
/// It sees every envelope before any registered handler.
pub trait SyncHandler: Send + Sync + 'static {
    fn handle(&self, envelope: &Envelope, control: &SyncControl);

    /// `peer` was chosen as the sync source.
    fn start_sync(&self, peer: &Peer, control: &SyncControl);
}

/// Lets the sync collaborator report back to the client.
#[derive(Clone)]
pub struct SyncControl {
    dispatch: mpsc::Sender<EnvelopeMsg>,
}

impl SyncControl {
    pub(crate) fn new(dispatch: mpsc::Sender<EnvelopeMsg>) -> Self {
        Self { dispatch }
    }

    /// Sync from `peer` is complete.
    pub fn finished(&self, peer: &Peer) {
        post(
            &self.dispatch,
            EnvelopeMsg::SyncSuccess {
                sender: peer.clone(),
            },
        );
    }
}

/// A sync collaborator that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSync;

impl SyncHandler for NoSync {
    fn handle(&self, _envelope: &Envelope, _control: &SyncControl) {}

    fn start_sync(&self, _peer: &Peer, _control: &SyncControl) {}
}
