//! P2P protocol messages.

use crate::encoding::{Pack, Unpack};
use crate::types::{Checksum256, NodeId, PublicKey, Signature, Tstamp};
use crate::{NetworkError, NetworkResult, MAX_MESSAGE_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of the frame header: length (4, little-endian) + type (1).
pub const FRAME_HEADER_SIZE: usize = 5;

/// Message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 0,
    ChainSize = 1,
    GoAway = 2,
    Time = 3,
    Notice = 4,
    Request = 5,
    SyncRequest = 6,
    SignedBlock = 7,
    PackedTransaction = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Handshake),
            1 => Ok(MessageType::ChainSize),
            2 => Ok(MessageType::GoAway),
            3 => Ok(MessageType::Time),
            4 => Ok(MessageType::Notice),
            5 => Ok(MessageType::Request),
            6 => Ok(MessageType::SyncRequest),
            7 => Ok(MessageType::SignedBlock),
            8 => Ok(MessageType::PackedTransaction),
            _ => Err(NetworkError::InvalidMessage(format!(
                "Unknown message type: {}",
                value
            ))),
        }
    }
}

impl MessageType {
    /// Types whose payload is carried through undecoded.
    pub fn is_opaque(&self) -> bool {
        matches!(
            self,
            MessageType::ChainSize | MessageType::SignedBlock | MessageType::PackedTransaction
        )
    }
}

/// Reason codes carried by a go-away message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GoAwayReason {
    NoReason = 0,
    SelfConnect = 1,
    Duplicate = 2,
    WrongChain = 3,
    WrongVersion = 4,
    Forked = 5,
    Unlinkable = 6,
    BadTransaction = 7,
    Validation = 8,
    BenignOther = 9,
    FatalOther = 10,
    Authentication = 11,
}

impl TryFrom<u8> for GoAwayReason {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use GoAwayReason::*;
        Ok(match value {
            0 => NoReason,
            1 => SelfConnect,
            2 => Duplicate,
            3 => WrongChain,
            4 => WrongVersion,
            5 => Forked,
            6 => Unlinkable,
            7 => BadTransaction,
            8 => Validation,
            9 => BenignOther,
            10 => FatalOther,
            11 => Authentication,
            _ => {
                return Err(NetworkError::InvalidMessage(format!(
                    "Unknown go away reason: {}",
                    value
                )))
            }
        })
    }
}

impl fmt::Display for GoAwayReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GoAwayReason::NoReason => "no reason",
            GoAwayReason::SelfConnect => "self connect",
            GoAwayReason::Duplicate => "duplicate",
            GoAwayReason::WrongChain => "wrong chain",
            GoAwayReason::WrongVersion => "wrong version",
            GoAwayReason::Forked => "chain is forked",
            GoAwayReason::Unlinkable => "unlinkable block received",
            GoAwayReason::BadTransaction => "bad transaction",
            GoAwayReason::Validation => "invalid block",
            GoAwayReason::BenignOther => "some other non-fatal condition",
            GoAwayReason::FatalOther => "some other failure",
            GoAwayReason::Authentication => "authentication failure",
        };
        f.write_str(s)
    }
}

/// Connection-establishment message.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeMessage {
    pub network_version: u16,
    pub chain_id: Checksum256,
    pub node_id: NodeId,
    pub key: PublicKey,
    pub time: Tstamp,
    pub token: Checksum256,
    pub signature: Signature,
    pub p2p_address: String,
    pub last_irreversible_block_num: u32,
    pub last_irreversible_block_id: Checksum256,
    pub head_num: u32,
    pub head_id: Checksum256,
    pub os: String,
    pub agent: String,
    pub generation: i16,
}

impl Pack for HandshakeMessage {
    fn pack(&self, buf: &mut BytesMut) {
        self.network_version.pack(buf);
        self.chain_id.pack(buf);
        self.node_id.pack(buf);
        self.key.pack(buf);
        self.time.pack(buf);
        self.token.pack(buf);
        self.signature.pack(buf);
        self.p2p_address.pack(buf);
        self.last_irreversible_block_num.pack(buf);
        self.last_irreversible_block_id.pack(buf);
        self.head_num.pack(buf);
        self.head_id.pack(buf);
        self.os.pack(buf);
        self.agent.pack(buf);
        self.generation.pack(buf);
    }
}

impl Unpack for HandshakeMessage {
    fn unpack(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            network_version: Unpack::unpack(buf)?,
            chain_id: Unpack::unpack(buf)?,
            node_id: Unpack::unpack(buf)?,
            key: Unpack::unpack(buf)?,
            time: Unpack::unpack(buf)?,
            token: Unpack::unpack(buf)?,
            signature: Unpack::unpack(buf)?,
            p2p_address: Unpack::unpack(buf)?,
            last_irreversible_block_num: Unpack::unpack(buf)?,
            last_irreversible_block_id: Unpack::unpack(buf)?,
            head_num: Unpack::unpack(buf)?,
            head_id: Unpack::unpack(buf)?,
            os: Unpack::unpack(buf)?,
            agent: Unpack::unpack(buf)?,
            generation: Unpack::unpack(buf)?,
        })
    }
}

/// Announces an intentional disconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct GoAwayMessage {
    pub reason: GoAwayReason,
    pub node_id: NodeId,
}

impl Pack for GoAwayMessage {
    fn pack(&self, buf: &mut BytesMut) {
        (self.reason as u8).pack(buf);
        self.node_id.pack(buf);
    }
}

impl Unpack for GoAwayMessage {
    fn unpack(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            reason: GoAwayReason::try_from(u8::unpack(buf)?)?,
            node_id: Unpack::unpack(buf)?,
        })
    }
}

/// Time-sync message with NTP-style origin/receive/transmit/destination stamps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeMessage {
    pub origin: Tstamp,
    pub receive: Tstamp,
    pub transmit: Tstamp,
    pub destination: Tstamp,
}

impl Pack for TimeMessage {
    fn pack(&self, buf: &mut BytesMut) {
        self.origin.pack(buf);
        self.receive.pack(buf);
        self.transmit.pack(buf);
        self.destination.pack(buf);
    }
}

impl Unpack for TimeMessage {
    fn unpack(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            origin: Unpack::unpack(buf)?,
            receive: Unpack::unpack(buf)?,
            transmit: Unpack::unpack(buf)?,
            destination: Unpack::unpack(buf)?,
        })
    }
}

/// Ordered-range encoding: a 4-byte mode tag, a pending count and known ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderedIds {
    pub mode: [u8; 4],
    pub pending: u32,
    pub ids: Vec<Checksum256>,
}

impl OrderedIds {
    pub fn new(mode: u8, pending: u32) -> Self {
        Self {
            mode: [mode, 0, 0, 0],
            pending,
            ids: Vec::new(),
        }
    }
}

impl Pack for OrderedIds {
    fn pack(&self, buf: &mut BytesMut) {
        self.mode.pack(buf);
        self.pending.pack(buf);
        self.ids.pack(buf);
    }
}

impl Unpack for OrderedIds {
    fn unpack(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            mode: Unpack::unpack(buf)?,
            pending: Unpack::unpack(buf)?,
            ids: Unpack::unpack(buf)?,
        })
    }
}

/// Advertises head and last-irreversible positions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoticeMessage {
    pub known_trx: OrderedIds,
    pub known_blocks: OrderedIds,
}

impl Pack for NoticeMessage {
    fn pack(&self, buf: &mut BytesMut) {
        self.known_trx.pack(buf);
        self.known_blocks.pack(buf);
    }
}

impl Unpack for NoticeMessage {
    fn unpack(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            known_trx: Unpack::unpack(buf)?,
            known_blocks: Unpack::unpack(buf)?,
        })
    }
}

/// Requests transaction and block data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestMessage {
    pub req_trx: OrderedIds,
    pub req_blocks: OrderedIds,
}

impl Pack for RequestMessage {
    fn pack(&self, buf: &mut BytesMut) {
        self.req_trx.pack(buf);
        self.req_blocks.pack(buf);
    }
}

impl Unpack for RequestMessage {
    fn unpack(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            req_trx: Unpack::unpack(buf)?,
            req_blocks: Unpack::unpack(buf)?,
        })
    }
}

/// Requests a block range for synchronization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncRequestMessage {
    pub start_block: u32,
    pub end_block: u32,
}

impl Pack for SyncRequestMessage {
    fn pack(&self, buf: &mut BytesMut) {
        self.start_block.pack(buf);
        self.end_block.pack(buf);
    }
}

impl Unpack for SyncRequestMessage {
    fn unpack(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self {
            start_block: Unpack::unpack(buf)?,
            end_block: Unpack::unpack(buf)?,
        })
    }
}

/// P2P message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(HandshakeMessage),
    GoAway(GoAwayMessage),
    Time(TimeMessage),
    Notice(NoticeMessage),
    Request(RequestMessage),
    SyncRequest(SyncRequestMessage),
    /// Chain size, signed blocks and packed transactions pass through
    /// undecoded; their contents belong to the chain layer.
    Opaque { kind: MessageType, payload: Bytes },
}

impl Message {
    /// Get the message type.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Handshake(_) => MessageType::Handshake,
            Message::GoAway(_) => MessageType::GoAway,
            Message::Time(_) => MessageType::Time,
            Message::Notice(_) => MessageType::Notice,
            Message::Request(_) => MessageType::Request,
            Message::SyncRequest(_) => MessageType::SyncRequest,
            Message::Opaque { kind, .. } => *kind,
        }
    }

    fn pack_payload(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        match self {
            Message::Handshake(m) => m.pack(buf),
            Message::GoAway(m) => m.pack(buf),
            Message::Time(m) => m.pack(buf),
            Message::Notice(m) => m.pack(buf),
            Message::Request(m) => m.pack(buf),
            Message::SyncRequest(m) => m.pack(buf),
            Message::Opaque { kind, payload } => {
                if !kind.is_opaque() {
                    return Err(NetworkError::Encode(format!(
                        "{:?} must be sent as a typed message",
                        kind
                    )));
                }
                buf.put_slice(payload);
            }
        }
        Ok(())
    }

    /// Decode a payload of the given type.
    pub fn decode(kind: MessageType, mut payload: Bytes) -> NetworkResult<Self> {
        let message = match kind {
            MessageType::Handshake => Message::Handshake(Unpack::unpack(&mut payload)?),
            MessageType::GoAway => Message::GoAway(Unpack::unpack(&mut payload)?),
            MessageType::Time => Message::Time(Unpack::unpack(&mut payload)?),
            MessageType::Notice => Message::Notice(Unpack::unpack(&mut payload)?),
            MessageType::Request => Message::Request(Unpack::unpack(&mut payload)?),
            MessageType::SyncRequest => Message::SyncRequest(Unpack::unpack(&mut payload)?),
            kind => return Ok(Message::Opaque { kind, payload }),
        };

        if payload.has_remaining() {
            return Err(NetworkError::InvalidMessage(format!(
                "{} trailing bytes after {:?}",
                payload.remaining(),
                kind
            )));
        }
        Ok(message)
    }
}

/// A message tagged with its declared type, as it travels on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub kind: MessageType,
    pub message: Message,
}

impl Packet {
    pub fn new(message: Message) -> Self {
        Self {
            kind: message.message_type(),
            message,
        }
    }

    /// Encode the full frame (length, type, payload) into `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) -> NetworkResult<()> {
        let start = dst.len();
        dst.put_u32_le(0);
        dst.put_u8(self.kind as u8);
        self.message.pack_payload(dst)?;

        let length = dst.len() - start - 4;
        if length > MAX_MESSAGE_SIZE {
            dst.truncate(start);
            return Err(NetworkError::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            });
        }
        dst[start..start + 4].copy_from_slice(&(length as u32).to_le_bytes());
        Ok(())
    }

    /// Encode the full frame into a fresh buffer.
    pub fn encode(&self) -> NetworkResult<BytesMut> {
        let mut buf = BytesMut::with_capacity(512);
        self.encode_into(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_tags() {
        for tag in 0u8..=8 {
            let kind = MessageType::try_from(tag).unwrap();
            assert_eq!(kind as u8, tag);
        }
        assert!(MessageType::try_from(9).is_err());
    }

    #[test]
    fn test_sync_request_frame_layout() {
        let packet = Packet::new(Message::SyncRequest(SyncRequestMessage {
            start_block: 1,
            end_block: 2,
        }));
        let frame = packet.encode().unwrap();

        // length = type byte + two u32s
        assert_eq!(&frame[..4], &9u32.to_le_bytes());
        assert_eq!(frame[4], MessageType::SyncRequest as u8);
        assert_eq!(&frame[5..], &[1, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn test_notice_uses_mode_byte() {
        let notice = NoticeMessage {
            known_trx: OrderedIds::new(2, 100),
            known_blocks: OrderedIds::new(2, 90),
        };
        let frame = Packet::new(Message::Notice(notice.clone())).encode().unwrap();

        let payload = Bytes::copy_from_slice(&frame[FRAME_HEADER_SIZE..]);
        assert_eq!(&payload[..4], &[2, 0, 0, 0]);
        let decoded = Message::decode(MessageType::Notice, payload).unwrap();
        assert_eq!(decoded, Message::Notice(notice));
    }

    #[test]
    fn test_opaque_payload_passes_through() {
        let payload = Bytes::from_static(b"block-bytes");
        let decoded = Message::decode(MessageType::SignedBlock, payload.clone()).unwrap();
        assert_eq!(
            decoded,
            Message::Opaque {
                kind: MessageType::SignedBlock,
                payload
            }
        );
    }

    #[test]
    fn test_typed_kind_cannot_be_sent_opaque() {
        let packet = Packet::new(Message::Opaque {
            kind: MessageType::Handshake,
            payload: Bytes::new(),
        });
        assert!(matches!(packet.encode(), Err(NetworkError::Encode(_))));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let payload = Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 0, 0xAA]);
        assert!(Message::decode(MessageType::SyncRequest, payload).is_err());
    }

    #[test]
    fn test_go_away_reason_display() {
        assert_eq!(GoAwayReason::WrongChain.to_string(), "wrong chain");
        assert_eq!(GoAwayReason::try_from(11).unwrap(), GoAwayReason::Authentication);
        assert!(GoAwayReason::try_from(12).is_err());
    }
}
