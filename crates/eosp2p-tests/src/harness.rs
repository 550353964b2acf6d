//! Test harness for integration tests.
//!
//! Provides an in-memory dialer whose remote ends the test drives directly,
//! handlers and a sync collaborator that record what they see, and a
//! client factory with short timeouts.

use bytes::Bytes;
use eosp2p_network::{
    Client, ClientConfig, Connection, Dialer, Envelope, Handler, HandshakeMessage,
    LifecycleSnapshot, Message, MessageType, NetworkError, NetworkResult, Packet, PacketCodec,
    Peer, SyncControl, SyncHandler,
};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// Default wait for anything a test expects to happen.
pub const WAIT: Duration = Duration::from_secs(5);

/// The far side of one in-memory connection.
pub struct RemoteEnd {
    pub address: String,
    framed: Framed<DuplexStream, PacketCodec>,
}

impl RemoteEnd {
    /// Send a message to the client's peer.
    pub async fn send(&mut self, message: Message) {
        self.framed
            .send(Packet::new(message))
            .await
            .expect("remote send failed");
    }

    /// Write raw bytes, bypassing the codec.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.framed
            .get_mut()
            .write_all(bytes)
            .await
            .expect("remote raw write failed");
    }

    /// Next packet from the client, or `None` once the client closed.
    pub async fn recv(&mut self) -> Option<Packet> {
        match tokio::time::timeout(WAIT, self.framed.next()).await {
            Ok(Some(Ok(packet))) => Some(packet),
            Ok(Some(Err(e))) => panic!("remote decode failed: {}", e),
            Ok(None) => None,
            Err(_) => panic!("timed out waiting for a packet on {}", self.address),
        }
    }

    /// Next packet of the given type, skipping others.
    pub async fn recv_kind(&mut self, kind: MessageType) -> Packet {
        loop {
            match self.recv().await {
                Some(packet) if packet.kind == kind => return packet,
                Some(_) => continue,
                None => panic!("connection to {} closed before {:?}", self.address, kind),
            }
        }
    }

    /// Receive the client's handshake.
    pub async fn expect_handshake(&mut self) -> HandshakeMessage {
        match self.recv_kind(MessageType::Handshake).await.message {
            Message::Handshake(handshake) => handshake,
            other => panic!("expected handshake, got {:?}", other),
        }
    }

    /// Whether the client has closed its side.
    pub async fn is_closed_by_client(&mut self) -> bool {
        loop {
            match tokio::time::timeout(WAIT, self.framed.next()).await {
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) | Ok(None) => return true,
                Err(_) => return false,
            }
        }
    }
}

#[derive(Default)]
struct DialerState {
    refused: HashSet<String>,
    drop_remote: HashSet<String>,
    dials: HashMap<String, usize>,
}

/// Dials in-memory duplex streams and hands the remote ends to the test.
pub struct MemoryDialer {
    state: Mutex<DialerState>,
    remotes: mpsc::UnboundedSender<RemoteEnd>,
}

/// Receives the remote end of every successful dial.
pub struct Remotes {
    rx: mpsc::UnboundedReceiver<RemoteEnd>,
}

impl Remotes {
    pub async fn next(&mut self) -> RemoteEnd {
        tokio::time::timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for a dial")
            .expect("dialer dropped")
    }

    /// Next remote end for `address`, discarding others.
    pub async fn next_for(&mut self, address: &str) -> RemoteEnd {
        loop {
            let remote = self.next().await;
            if remote.address == address {
                return remote;
            }
        }
    }

    /// Whether a dial arrives within `within`.
    pub async fn has_dial_within(&mut self, within: Duration) -> bool {
        matches!(tokio::time::timeout(within, self.rx.recv()).await, Ok(Some(_)))
    }
}

impl MemoryDialer {
    pub fn new() -> (Arc<Self>, Remotes) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            state: Mutex::new(DialerState::default()),
            remotes: tx,
        });
        (dialer, Remotes { rx })
    }

    /// Fail every dial to `address` until [`MemoryDialer::accept`].
    pub fn refuse(&self, address: &str) {
        self.state.lock().refused.insert(address.to_string());
    }

    pub fn accept(&self, address: &str) {
        self.state.lock().refused.remove(address);
    }

    /// Connect, but drop the remote end at once, so the first write fails.
    pub fn drop_remote(&self, address: &str) {
        self.state.lock().drop_remote.insert(address.to_string());
    }

    pub fn dials(&self, address: &str) -> usize {
        self.state.lock().dials.get(address).copied().unwrap_or(0)
    }
}

impl Dialer for MemoryDialer {
    fn dial(&self, address: &str) -> BoxFuture<'static, NetworkResult<Connection>> {
        let mut state = self.state.lock();
        *state.dials.entry(address.to_string()).or_default() += 1;

        let result = if state.refused.contains(address) {
            Err(NetworkError::ConnectionFailed(format!("{}: refused", address)))
        } else {
            let (local, remote) = tokio::io::duplex(256 * 1024);
            if state.drop_remote.remove(address) {
                drop(remote);
            } else {
                let _ = self.remotes.send(RemoteEnd {
                    address: address.to_string(),
                    framed: Framed::new(remote, PacketCodec::new()),
                });
            }
            Ok(Box::new(local) as Connection)
        };
        Box::pin(async move { result })
    }
}

/// One observation: who saw which packet from where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub observer: String,
    pub kind: MessageType,
    pub from: String,
}

/// Observations shared by every recorder in a test, in arrival order.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Seen>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, observer: &str, envelope: &Envelope) {
        self.events.lock().push(Seen {
            observer: observer.to_string(),
            kind: envelope.packet.kind,
            from: envelope.sender.address().to_string(),
        });
    }

    pub fn events(&self) -> Vec<Seen> {
        self.events.lock().clone()
    }

    /// Observers of packets of `kind`, in order.
    pub fn observers_of(&self, kind: MessageType) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.observer.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// Handler that records every envelope under its label.
///
/// The label is separate from the name so a replaced handler can be told
/// apart from its replacement.
pub struct RecordingHandler {
    name: String,
    label: String,
    log: EventLog,
}

impl RecordingHandler {
    pub fn new(name: &str, label: &str, log: &EventLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            label: label.to_string(),
            log: log.clone(),
        })
    }
}

impl Handler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, envelope: &Envelope) {
        self.log.record(&self.label, envelope);
    }
}

/// Sync collaborator that records envelopes as `"sync"` and every
/// start-sync call.
pub struct RecordingSync {
    log: EventLog,
    starts: Mutex<Vec<Peer>>,
    finish_on_start: bool,
}

impl RecordingSync {
    pub fn new(log: &EventLog) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            starts: Mutex::new(Vec::new()),
            finish_on_start: false,
        })
    }

    /// Reports sync finished as soon as it starts.
    pub fn finishing(log: &EventLog) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            starts: Mutex::new(Vec::new()),
            finish_on_start: true,
        })
    }

    /// Addresses start-sync was called with, in order.
    pub fn started(&self) -> Vec<String> {
        self.starts
            .lock()
            .iter()
            .map(|p| p.address().to_string())
            .collect()
    }
}

impl SyncHandler for RecordingSync {
    fn handle(&self, envelope: &Envelope, _control: &SyncControl) {
        self.log.record("sync", envelope);
    }

    fn start_sync(&self, peer: &Peer, control: &SyncControl) {
        self.starts.lock().push(peer.clone());
        if self.finish_on_start {
            control.finished(peer);
        }
    }
}

/// Client configuration with timings suited to tests.
pub fn test_config(need_sync: bool) -> ClientConfig {
    ClientConfig {
        agent: "eosp2p-tests".to_string(),
        p2p_address: "127.0.0.1:19876".to_string(),
        need_sync,
        reconnect_delay: Duration::from_millis(50),
        close_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

/// Start a client over `dialer` with the given sync collaborator.
pub fn start_client(
    config: ClientConfig,
    dialer: Arc<MemoryDialer>,
    sync: Arc<dyn SyncHandler>,
) -> Client {
    Client::builder(config).dialer(dialer).sync(sync).start()
}

/// Poll `condition` until it holds, panicking after [`WAIT`].
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll the client's snapshot until `condition` holds.
pub async fn wait_for_snapshot<F>(client: &Client, what: &str, condition: F) -> LifecycleSnapshot
where
    F: Fn(&LifecycleSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let snapshot = client.snapshot().await.expect("client stopped");
        if condition(&snapshot) {
            return snapshot;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}: {:?}", what, snapshot);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// An opaque signed-block frame.
pub fn signed_block(payload: &'static [u8]) -> Message {
    Message::Opaque {
        kind: MessageType::SignedBlock,
        payload: Bytes::from_static(payload),
    }
}
