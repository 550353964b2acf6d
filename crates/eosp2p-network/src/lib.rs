//! # eosp2p-network
//!
//! Peer networking core for EOSIO-protocol nodes.
//!
//! This crate provides:
//! - The binary wire protocol (handshake, go-away, time, notice, request,
//!   sync-request) and its framing codec
//! - Outbound peer connections with handshake and a reader task per peer
//! - A peer lifecycle loop owning the peer table, reconnects and sync-peer
//!   selection
//! - A packet dispatch loop owning the handler registry and routing every
//!   inbound packet to the sync collaborator, then to each handler in order
//!
//! Both loops are single tasks fed by mailboxes; neither the peer table nor
//! the handler registry is shared.

mod client;
mod codec;
mod connection;
mod dispatch;
mod encoding;
mod error;
mod handler;
mod handshake;
mod lifecycle;
mod mailbox;
mod message;
mod peer;
mod types;

pub use client::{Client, ClientBuilder, ClientConfig};
pub use codec::PacketCodec;
pub use connection::{AsyncStream, Connection, ConnectionConfig, Dialer, TcpDialer};
pub use dispatch::HandlerRegistry;
pub use encoding::{get_varuint32, put_varuint32, Pack, Unpack};
pub use error::{NetworkError, NetworkResult};
pub use handler::{Envelope, Handler, NoSync, SyncControl, SyncHandler};
pub use handshake::{
    ChainView, HandshakeInfo, HandshakeSigner, NullSigner, StaticChain, HANDSHAKE_GENERATION,
    NETWORK_VERSION,
};
pub use lifecycle::{LifecycleSnapshot, PeerSnapshot, PeerState};
pub use message::{
    GoAwayMessage, GoAwayReason, HandshakeMessage, Message, MessageType, NoticeMessage,
    OrderedIds, Packet, RequestMessage, SyncRequestMessage, TimeMessage,
};
pub use peer::{Peer, PeerCloser, PeerConfig};
pub use types::{Checksum256, CurveType, NodeId, PublicKey, Signature, Tstamp};

/// Default P2P port.
pub const DEFAULT_PORT: u16 = 9876;

/// Maximum frame size (type byte plus payload).
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;
