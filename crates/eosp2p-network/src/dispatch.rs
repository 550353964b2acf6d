//! Packet dispatch loop.
//!
//! A single task owns the handler registry and routes every inbound packet:
//! first to the sync collaborator, then to each handler in registration
//! order. Registry changes and peer errors arrive through the same mailbox,
//! so the registry is never touched from anywhere else.

use crate::handler::{Envelope, Handler, SyncControl, SyncHandler};
use crate::lifecycle::PeerMsg;
use crate::mailbox::post;
use crate::peer::PeerCloser;
use crate::{NetworkError, Packet, Peer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Dispatch mailbox element.
pub(crate) enum EnvelopeMsg {
    AddHandler(Arc<dyn Handler>),
    DelHandler(String),
    Error { sender: Peer, error: NetworkError },
    Packet { sender: Peer, packet: Packet },
    StartSync { sender: Peer },
    SyncSuccess { sender: Peer },
}

/// Ordered handlers, at most one per name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler, replacing in place any handler with the same name.
    ///
    /// Returns `true` if an existing handler was replaced.
    pub fn add(&mut self, handler: Arc<dyn Handler>) -> bool {
        match self.handlers.iter().position(|h| h.name() == handler.name()) {
            Some(idx) => {
                self.handlers[idx] = handler;
                true
            }
            None => {
                self.handlers.push(handler);
                false
            }
        }
    }

    /// Remove the handler with this name, keeping the others in order.
    ///
    /// Returns `false` if there was none.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.handlers.iter().position(|h| h.name() == name) {
            Some(idx) => {
                self.handlers.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Handler>> {
        self.handlers.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.iter().map(|h| h.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub(crate) struct PacketDispatcher {
    rx: mpsc::Receiver<EnvelopeMsg>,
    handlers: HandlerRegistry,
    sync: Arc<dyn SyncHandler>,
    control: SyncControl,
    peer_tx: mpsc::Sender<PeerMsg>,
    closer: PeerCloser,
    close_timeout: Duration,
    shutdown: CancellationToken,
    stopping: bool,
}

impl PacketDispatcher {
    pub(crate) fn new(
        rx: mpsc::Receiver<EnvelopeMsg>,
        sync: Arc<dyn SyncHandler>,
        control: SyncControl,
        peer_tx: mpsc::Sender<PeerMsg>,
        closer: PeerCloser,
        close_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            rx,
            handlers: HandlerRegistry::new(),
            sync,
            control,
            peer_tx,
            closer,
            close_timeout,
            shutdown,
            stopping: false,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    match msg {
                        Some(msg) => self.on_message(msg),
                        None => {
                            info!("Packet dispatch loop stopped");
                            return;
                        }
                    }
                }

                _ = self.shutdown.cancelled(), if !self.stopping => {
                    self.stopping = true;
                    info!("Closing p2p client");
                    self.closer.close_all(self.close_timeout).await;
                    info!("All peers closed, closing dispatch mailbox");
                    self.rx.close();
                }
            }
        }
    }

    fn on_message(&mut self, msg: EnvelopeMsg) {
        match msg {
            EnvelopeMsg::AddHandler(handler) => self.on_add_handler(handler),
            EnvelopeMsg::DelHandler(name) => self.on_del_handler(&name),
            // Once stopping, nothing may reach handlers or restart peers.
            _ if self.stopping => trace!("Dropping message during shutdown"),
            EnvelopeMsg::StartSync { sender } => {
                info!(addr = %sender.address(), "Starting sync");
                self.sync.start_sync(&sender, &self.control);
            }
            EnvelopeMsg::SyncSuccess { sender } => {
                post(&self.peer_tx, PeerMsg::SyncFinished { peer: sender });
            }
            EnvelopeMsg::Error { sender, error } => self.on_peer_error(sender, error),
            EnvelopeMsg::Packet { sender, packet } => self.on_packet(sender, packet),
        }
    }

    fn on_add_handler(&mut self, handler: Arc<dyn Handler>) {
        let name = handler.name().to_string();
        if self.handlers.add(handler) {
            info!(name = %name, "Replaced handler");
        } else {
            info!(name = %name, "New handler");
        }
    }

    fn on_del_handler(&mut self, name: &str) {
        if self.handlers.remove(name) {
            info!(name = %name, "Deleted handler");
        } else {
            warn!(name = %name, "No handler found to delete");
        }
    }

    fn on_packet(&self, sender: Peer, packet: Packet) {
        trace!(addr = %sender.address(), kind = ?packet.kind, "Dispatching packet");
        let envelope = Envelope::new(sender, packet);
        self.sync.handle(&envelope, &self.control);
        for handler in self.handlers.iter() {
            handler.handle(&envelope);
        }
    }

    fn on_peer_error(&self, sender: Peer, error: NetworkError) {
        if error.is_eof() {
            info!(addr = %sender.address(), "Connection closed");
            post(&self.peer_tx, PeerMsg::ErrPeer { peer: sender, error });
        } else {
            debug!(addr = %sender.address(), error = %error, "Peer read error");
        }
    }
}
