//! Peer connections.
//!
//! A [`Peer`] is a cheap handle to one remote node. It owns the transport:
//! [`Peer::start`] dials and sends the handshake, then a reader task feeds
//! every decoded packet into the dispatch mailbox and reports transport
//! errors the same way. Each session has its own write half behind an async
//! mutex, so concurrent sends serialize at the write. Writes are bounded by a
//! timeout and abort when their session ends, so a stalled transport never
//! holds up a restart. The transport is shut down once, by the reader task on
//! its way out.

use crate::connection::{Connection, Dialer};
use crate::dispatch::EnvelopeMsg;
use crate::handshake::{HandshakeInfo, HandshakeSigner, HANDSHAKE_GENERATION, NETWORK_VERSION};
use crate::message::{
    GoAwayMessage, GoAwayReason, HandshakeMessage, Message, NoticeMessage, OrderedIds, Packet,
    RequestMessage, SyncRequestMessage, TimeMessage,
};
use crate::types::{Checksum256, NodeId};
use crate::codec::ReadCodec;
use crate::{NetworkError, NetworkResult};
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument, Span};

/// Immutable connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Remote address, `host:port`.
    pub address: String,
}

impl PeerConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

/// Closes every peer at once.
///
/// Each peer's cancellation token is a child of `root`, and every reader task
/// runs on `tasks`, so cancelling the root and waiting on the tracker tears
/// down all transports without touching the peer table.
#[derive(Clone, Default)]
pub struct PeerCloser {
    root: CancellationToken,
    tasks: TaskTracker,
}

impl PeerCloser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close all peers and wait (bounded) for their readers to finish.
    pub async fn close_all(&self, timeout: Duration) {
        self.root.cancel();
        self.tasks.close();
        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_err() {
            warn!(
                remaining = self.tasks.len(),
                "Timed out waiting for peers to close"
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.root.is_cancelled()
    }
}

/// Everything a peer needs from the node that owns it.
#[derive(Clone)]
pub(crate) struct PeerContext {
    pub node_id: NodeId,
    pub agent: String,
    pub p2p_address: String,
    pub signer: Arc<dyn HandshakeSigner>,
    pub dialer: Arc<dyn Dialer>,
    pub dispatch: mpsc::Sender<EnvelopeMsg>,
    pub closer: PeerCloser,
    pub close_timeout: Duration,
    pub write_timeout: Duration,
    pub span: Span,
}

struct Session {
    token: CancellationToken,
    reader: JoinHandle<()>,
}

/// Write half of one session.
#[derive(Clone)]
struct SessionWriter {
    io: Arc<tokio::sync::Mutex<WriteHalf<Connection>>>,
    /// The session's token; cancelling it aborts in-flight writes.
    token: CancellationToken,
}

impl SessionWriter {
    fn is(&self, other: &SessionWriter) -> bool {
        Arc::ptr_eq(&self.io, &other.io)
    }
}

struct PeerInner {
    address: String,
    config: PeerConfig,
    /// Seed data announced in handshakes.
    info: HandshakeInfo,
    ctx: PeerContext,
    /// Cancelled on explicit close; a closed peer never starts again.
    token: CancellationToken,
    writer: Mutex<Option<SessionWriter>>,
    session: Mutex<Option<Session>>,
    connected: AtomicBool,
    remote: RwLock<Option<HandshakeMessage>>,
    span: Span,
}

/// Handle to one remote peer.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Peer {}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.inner.address)
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Peer {
    pub(crate) fn new(config: PeerConfig, ctx: &PeerContext, info: HandshakeInfo) -> Self {
        let span = tracing::info_span!(parent: &ctx.span, "peer", addr = %config.address);
        Self {
            inner: Arc::new(PeerInner {
                address: config.address.clone(),
                config,
                info,
                token: ctx.closer.root.child_token(),
                ctx: ctx.clone(),
                writer: Mutex::new(None),
                session: Mutex::new(None),
                connected: AtomicBool::new(false),
                remote: RwLock::new(None),
                span,
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn config(&self) -> &PeerConfig {
        &self.inner.config
    }

    /// This node's identifier, as announced to the peer.
    pub fn node_id(&self) -> NodeId {
        self.inner.ctx.node_id
    }

    pub fn agent(&self) -> &str {
        &self.inner.ctx.agent
    }

    /// Handshake seed data sampled when the peer was created.
    pub fn handshake_info(&self) -> &HandshakeInfo {
        &self.inner.info
    }

    /// The last handshake received from the remote node.
    pub fn remote_handshake(&self) -> Option<HandshakeMessage> {
        self.inner.remote.read().clone()
    }

    /// The remote node's identifier, once its handshake arrived.
    pub fn remote_node_id(&self) -> Option<NodeId> {
        self.inner.remote.read().as_ref().map(|h| h.node_id)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Connect, send the handshake and start reading.
    ///
    /// A previous session, if any, is torn down first.
    pub async fn start(&self) -> NetworkResult<()> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(NetworkError::PeerClosed(inner.address.clone()));
        }

        self.stop_session().await;
        *inner.remote.write() = None;

        let conn = tokio::select! {
            conn = inner.ctx.dialer.dial(&inner.address) => conn?,
            _ = inner.token.cancelled() => {
                return Err(NetworkError::PeerClosed(inner.address.clone()));
            }
        };

        let token = inner.token.child_token();
        let (read_half, write_half) = tokio::io::split(conn);
        let writer = SessionWriter {
            io: Arc::new(tokio::sync::Mutex::new(write_half)),
            token: token.clone(),
        };
        *inner.writer.lock() = Some(writer.clone());
        inner.connected.store(true, Ordering::Release);

        if let Err(e) = self.send_handshake(&inner.info).await {
            token.cancel();
            self.release_writer(&writer).await;
            return Err(e);
        }

        let reader = inner.ctx.closer.tasks.spawn(
            read_loop(self.clone(), read_half, writer, token.clone())
                .instrument(inner.span.clone()),
        );
        *inner.session.lock() = Some(Session { token, reader });

        info!(parent: &inner.span, "Peer started");
        Ok(())
    }

    /// Request the transport to close. The peer will not start again.
    pub fn close(&self) {
        debug!(parent: &self.inner.span, "Closing peer");
        self.inner.token.cancel();
    }

    /// Wait (bounded) until the reader task has torn down the transport.
    pub async fn wait(&self) {
        let session = self.inner.session.lock().take();
        if let Some(session) = session {
            self.await_reader(session.reader).await;
        }
    }

    async fn stop_session(&self) {
        let session = self.inner.session.lock().take();
        if let Some(session) = session {
            session.token.cancel();
            self.await_reader(session.reader).await;
        }
    }

    async fn await_reader(&self, reader: JoinHandle<()>) {
        match tokio::time::timeout(self.inner.ctx.close_timeout, reader).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(parent: &self.inner.span, error = %e, "Reader task failed"),
            Err(_) => warn!(parent: &self.inner.span, "Timed out waiting for peer to close"),
        }
    }

    /// Shut down a session's write half. The session's token must already be
    /// cancelled so no write still holds it.
    async fn release_writer(&self, writer: &SessionWriter) {
        {
            let mut current = self.inner.writer.lock();
            if current.as_ref().is_some_and(|w| w.is(writer)) {
                *current = None;
                self.inner.connected.store(false, Ordering::Release);
            }
        }

        let released = tokio::time::timeout(self.inner.ctx.close_timeout, async {
            let _ = writer.io.lock().await.shutdown().await;
        })
        .await;
        if released.is_err() {
            warn!(parent: &self.inner.span, "Timed out shutting down transport");
        }
    }

    fn observe(&self, packet: &Packet) {
        if let Message::Handshake(handshake) = &packet.message {
            debug!(
                parent: &self.inner.span,
                remote_node = %handshake.node_id,
                agent = %handshake.agent,
                head = handshake.head_num,
                lib = handshake.last_irreversible_block_num,
                "Received handshake"
            );
            *self.inner.remote.write() = Some(handshake.clone());
        }
    }

    /// Encode a message and write it to the transport in one call.
    pub async fn write_p2p_message(&self, message: Message) -> NetworkResult<()> {
        let address = &self.inner.address;
        let kind = message.message_type();
        let buf = Packet::new(message)
            .encode()
            .map_err(|e| NetworkError::Encode(format!("unable to encode {:?}: {}", kind, e)).at_peer(address))?;

        let writer = self
            .inner
            .writer
            .lock()
            .clone()
            .ok_or_else(|| NetworkError::NotConnected(address.clone()).at_peer(address))?;

        let write_timeout = self.inner.ctx.write_timeout;
        let write = async {
            let mut io = writer.io.lock().await;
            io.write_all(&buf).await
        };
        tokio::select! {
            _ = writer.token.cancelled() => {
                Err(NetworkError::NotConnected(address.clone()).at_peer(address))
            }
            result = tokio::time::timeout(write_timeout, write) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(NetworkError::Io(e).at_peer(address)),
                Err(_) => Err(NetworkError::Timeout(format!(
                    "write of {:?} after {:?}",
                    kind, write_timeout
                ))
                .at_peer(address)),
            },
        }
    }

    /// Announce an intentional disconnect.
    pub async fn send_go_away(&self, reason: GoAwayReason) -> NetworkResult<()> {
        debug!(parent: &self.inner.span, reason = %reason, "SendGoAway");
        self.write_p2p_message(Message::GoAway(GoAwayMessage {
            reason,
            node_id: self.inner.ctx.node_id,
        }))
        .await
    }

    /// Request a block range for synchronization.
    pub async fn send_sync_request(&self, start_block: u32, end_block: u32) -> NetworkResult<()> {
        debug!(parent: &self.inner.span, start = start_block, end = end_block, "SendSyncRequest");
        self.write_p2p_message(Message::SyncRequest(SyncRequestMessage {
            start_block,
            end_block,
        }))
        .await
    }

    /// Request transaction and block data.
    pub async fn send_request(&self, start_block: u32, end_block: u32) -> NetworkResult<()> {
        debug!(parent: &self.inner.span, start = start_block, end = end_block, "SendRequest");
        self.write_p2p_message(Message::Request(RequestMessage {
            req_trx: OrderedIds::new(0, start_block),
            req_blocks: OrderedIds::new(0, end_block),
        }))
        .await
    }

    /// Advertise head and last-irreversible block numbers.
    pub async fn send_notice(&self, head_block_num: u32, lib_num: u32, mode: u8) -> NetworkResult<()> {
        debug!(
            parent: &self.inner.span,
            head = head_block_num,
            lib = lib_num,
            mode,
            "SendNotice"
        );
        self.write_p2p_message(Message::Notice(NoticeMessage {
            known_trx: OrderedIds::new(mode, head_block_num),
            known_blocks: OrderedIds::new(mode, lib_num),
        }))
        .await
    }

    /// Content-free liveness ping.
    pub async fn send_time(&self) -> NetworkResult<()> {
        debug!(parent: &self.inner.span, "SendTime");
        self.write_p2p_message(Message::Time(TimeMessage::default())).await
    }

    /// Send the handshake.
    ///
    /// Only a signing failure is returned. A failed write is logged and the
    /// connection carries on; a dead transport shows up on the read path.
    pub async fn send_handshake(&self, info: &HandshakeInfo) -> NetworkResult<()> {
        let ctx = &self.inner.ctx;
        let token = Checksum256::default();
        let signature = ctx.signer.sign(&token).map_err(|e| {
            NetworkError::HandshakeFailed(format!("sending handshake to {}: {}", self.inner.address, e))
        })?;

        let handshake = HandshakeMessage {
            network_version: NETWORK_VERSION,
            chain_id: info.chain_id,
            node_id: ctx.node_id,
            key: ctx.signer.public_key(),
            time: info.head_block_time,
            token,
            signature,
            p2p_address: ctx.p2p_address.clone(),
            last_irreversible_block_num: info.last_irreversible_block_num,
            last_irreversible_block_id: info.last_irreversible_block_id,
            head_num: info.head_block_num,
            head_id: info.head_block_id,
            os: std::env::consts::OS.to_string(),
            agent: ctx.agent.clone(),
            generation: HANDSHAKE_GENERATION,
        };

        debug!(
            parent: &self.inner.span,
            head = info.head_block_num,
            lib = info.last_irreversible_block_num,
            "SendHandshake"
        );
        if let Err(e) = self.write_p2p_message(Message::Handshake(handshake)).await {
            warn!(parent: &self.inner.span, error = %e, "sending handshake failed");
        }
        Ok(())
    }
}

async fn read_loop(
    peer: Peer,
    read_half: ReadHalf<Connection>,
    writer: SessionWriter,
    token: CancellationToken,
) {
    let dispatch = peer.inner.ctx.dispatch.clone();
    let mut frames = FramedRead::new(read_half, ReadCodec::new());

    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => break,
            frame = frames.next() => match frame {
                Some(Ok(Ok(packet))) => {
                    peer.observe(&packet);
                    EnvelopeMsg::Packet { sender: peer.clone(), packet }
                }
                Some(Ok(Err(error))) => {
                    debug!(error = %error, "Undecodable message");
                    EnvelopeMsg::Error { sender: peer.clone(), error }
                }
                // The stream ends after this; the end is reported next.
                Some(Err(error)) => {
                    warn!(error = %error, "Receive error");
                    EnvelopeMsg::Error { sender: peer.clone(), error }
                }
                None => {
                    debug!("Connection closed by peer");
                    EnvelopeMsg::Error {
                        sender: peer.clone(),
                        error: NetworkError::ConnectionClosed,
                    }
                }
            },
        };

        let fatal = matches!(&msg, EnvelopeMsg::Error { error, .. } if error.is_eof());
        tokio::select! {
            _ = token.cancelled() => break,
            sent = dispatch.send(msg) => {
                if sent.is_err() {
                    break;
                }
            }
        }
        if fatal {
            break;
        }
    }

    token.cancel();
    peer.release_writer(&writer).await;
    debug!("Reader stopped");
}
