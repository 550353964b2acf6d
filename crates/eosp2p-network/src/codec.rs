//! Packet framing for the read path.
//!
//! ```text
//! +----------+----------+---------------------+
//! |  Length  |   Type   |       Payload       |
//! | 4 bytes  |  1 byte  | (Length - 1 bytes)  |
//! +----------+----------+---------------------+
//! ```
//!
//! - Length: little-endian, counts the type byte plus the payload
//! - Type: [`MessageType`] tag
//! - Payload: message body in the shared binary encoding

use crate::message::FRAME_HEADER_SIZE;
use crate::{Message, MessageType, NetworkError, NetworkResult, Packet, MAX_MESSAGE_SIZE};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame codec for [`Packet`]s.
pub struct PacketCodec {
    /// Maximum allowed frame length.
    max_size: usize,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self {
            max_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Create a codec with a custom frame limit.
    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCodec {
    /// Split one frame off `src`.
    ///
    /// The frame is consumed before its type is checked, so one bad frame
    /// does not wedge the stream. Only framing errors are returned as `Err`.
    fn decode_frame(&self, src: &mut BytesMut) -> NetworkResult<Option<NetworkResult<Packet>>> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length == 0 {
            return Err(NetworkError::InvalidMessage("Zero-length frame".into()));
        }
        if length > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: length,
                max: self.max_size,
            });
        }

        let total_size = 4 + length;
        if src.len() < total_size {
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        src.advance(4);
        let kind = MessageType::try_from(src.get_u8());
        let payload = src.split_to(length - 1).freeze();

        Ok(Some(kind.and_then(|kind| {
            let message = Message::decode(kind, payload)?;
            Ok(Packet { kind, message })
        })))
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_frame(src)?.transpose()
    }
}

/// Read-path decoder.
///
/// A frame whose message fails to decode is yielded as an `Err` item and the
/// stream carries on; a framed stream stops after the decoder itself fails.
pub(crate) struct ReadCodec(PacketCodec);

impl ReadCodec {
    pub(crate) fn new() -> Self {
        Self(PacketCodec::new())
    }
}

impl Decoder for ReadCodec {
    type Item = NetworkResult<Packet>;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.0.decode_frame(src)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GoAwayMessage, GoAwayReason, NodeId, TimeMessage};

    #[test]
    fn test_codec_roundtrip() {
        let mut codec = PacketCodec::new();
        let packet = Packet::new(Message::GoAway(GoAwayMessage {
            reason: GoAwayReason::Duplicate,
            node_id: NodeId::random(),
        }));

        let mut buf = BytesMut::new();
        codec.encode(packet.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = PacketCodec::new();
        let frame = Packet::new(Message::Time(TimeMessage::default()))
            .encode()
            .unwrap();

        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[frame.len() - 1..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Packet::new(Message::Time(TimeMessage::default())), &mut buf)
            .unwrap();
        codec
            .encode(Packet::new(Message::Time(TimeMessage::default())), &mut buf)
            .unwrap();

        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = PacketCodec::with_max_size(16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&1024u32.to_le_bytes());
        buf.extend_from_slice(&[MessageType::SignedBlock as u8]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(NetworkError::MessageTooLarge { size: 1024, max: 16 })
        ));
    }

    #[test]
    fn test_unknown_type_consumes_frame() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&[0xEE, 0x00]);

        assert!(codec.decode(&mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_read_codec_continues_after_bad_message() {
        let mut codec = ReadCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&[0xEE, 0x00]);
        Packet::new(Message::Time(TimeMessage::default()))
            .encode_into(&mut buf)
            .unwrap();

        assert!(matches!(codec.decode(&mut buf), Ok(Some(Err(_)))));
        let packet = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(packet.kind, MessageType::Time);
    }
}
