//! Wire-level framing: the 32-byte handshake and the length-prefixed message
//! protocol spoken between neighbors.
//!
//! Both codecs are pure buffer transforms plugged into
//! [`tokio_util::codec::Framed`]; no IO happens here.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    PeerId, PieceIndex,
};

/// Every connection opens with this ASCII header.
pub(crate) const PROTOCOL_HEADER: &[u8; 18] = b"P2PFILESHARINGPROJ";

/// Handshake frame layout: the 18-byte header, 10 zero bytes of padding, and
/// the sender's id as a 4-byte big endian integer.
const HANDSHAKE_LEN: usize = 32;
const HANDSHAKE_PAD_LEN: usize = 10;

const MSG_CHOKE: u8 = 0;
const MSG_UNCHOKE: u8 = 1;
const MSG_INTERESTED: u8 = 2;
const MSG_NOT_INTERESTED: u8 = 3;
const MSG_HAVE: u8 = 4;
const MSG_BITFIELD: u8 = 5;
const MSG_REQUEST: u8 = 6;
const MSG_PIECE: u8 = 7;

/// The opening frame identifying a peer on a new connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub peer_id: PeerId,
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_slice(PROTOCOL_HEADER);
        buf.put_bytes(0, HANDSHAKE_PAD_LEN);
        buf.put_u32(handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        let mut frame = buf.split_to(HANDSHAKE_LEN);
        if &frame[..PROTOCOL_HEADER.len()] != PROTOCOL_HEADER {
            return Err(Error::InvalidHandshake);
        }
        // the zero pad region is not validated
        frame.advance(PROTOCOL_HEADER.len() + HANDSHAKE_PAD_LEN);
        Ok(Some(Handshake {
            peer_id: frame.get_u32(),
        }))
    }
}

/// A message of the peer protocol.
///
/// The wire form is `{u32 length BE, u8 type, payload}` where `length` counts
/// the type byte plus the payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(PieceIndex),
    /// The sender's packed piece availability; its bit count is only known to
    /// the controller, so the raw bytes are carried here.
    Bitfield(Vec<u8>),
    Request(PieceIndex),
    Piece {
        index: PieceIndex,
        data: Vec<u8>,
    },
}

impl Message {
    /// The message's type byte on the wire.
    pub fn id(&self) -> u8 {
        match self {
            Message::Choke => MSG_CHOKE,
            Message::Unchoke => MSG_UNCHOKE,
            Message::Interested => MSG_INTERESTED,
            Message::NotInterested => MSG_NOT_INTERESTED,
            Message::Have(_) => MSG_HAVE,
            Message::Bitfield(_) => MSG_BITFIELD,
            Message::Request(_) => MSG_REQUEST,
            Message::Piece { .. } => MSG_PIECE,
        }
    }
}

/// Codec for everything after the handshake.
pub(crate) struct MessageCodec {
    /// Upper bound on the declared frame length, sized from the piece size;
    /// anything larger cannot be a legal frame and fails decoding early.
    max_frame_len: u32,
}

impl MessageCodec {
    pub fn new(piece_size: u32) -> Self {
        // the largest legal frame is a full piece: type byte, index, payload
        Self {
            max_frame_len: 1 + 4 + piece_size,
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        let id = msg.id();
        match msg {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(id);
            }
            Message::Have(index) | Message::Request(index) => {
                buf.put_u32(1 + 4);
                buf.put_u8(id);
                buf.put_u32(index as u32);
            }
            Message::Bitfield(bytes) => {
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(id);
                buf.put_slice(&bytes);
            }
            Message::Piece { index, data } => {
                buf.put_u32(1 + 4 + data.len() as u32);
                buf.put_u8(id);
                buf.put_u32(index as u32);
                buf.put_slice(&data);
            }
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let mut peek = &buf[..4];
        let len = peek.get_u32();
        if len == 0 || len > self.max_frame_len {
            return Err(Error::InvalidMessageLength(len));
        }
        if buf.len() < 4 + len as usize {
            // wait for the rest of the frame
            buf.reserve(4 + len as usize - buf.len());
            return Ok(None);
        }
        buf.advance(4);
        let mut frame = buf.split_to(len as usize);
        let id = frame.get_u8();

        let msg = match id {
            MSG_CHOKE | MSG_UNCHOKE | MSG_INTERESTED | MSG_NOT_INTERESTED => {
                if frame.has_remaining() {
                    return Err(Error::InvalidMessageLength(len));
                }
                match id {
                    MSG_CHOKE => Message::Choke,
                    MSG_UNCHOKE => Message::Unchoke,
                    MSG_INTERESTED => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            MSG_HAVE | MSG_REQUEST => {
                if frame.remaining() != 4 {
                    return Err(Error::InvalidMessageLength(len));
                }
                let index = frame.get_u32() as PieceIndex;
                if id == MSG_HAVE {
                    Message::Have(index)
                } else {
                    Message::Request(index)
                }
            }
            MSG_BITFIELD => Message::Bitfield(frame.to_vec()),
            MSG_PIECE => {
                if frame.remaining() < 4 {
                    return Err(Error::InvalidMessageLength(len));
                }
                let index = frame.get_u32() as PieceIndex;
                Message::Piece {
                    index,
                    data: frame.to_vec(),
                }
            }
            other => return Err(Error::UnknownMessageType(other)),
        };
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn encode_handshake(handshake: Handshake) -> BytesMut {
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        buf
    }

    #[test]
    fn handshake_layout() {
        let buf = encode_handshake(Handshake { peer_id: 1001 });
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        assert_eq!(&buf[..18], b"P2PFILESHARINGPROJ");
        assert_eq!(&buf[18..28], &[0; 10]);
        assert_eq!(&buf[28..], &1001u32.to_be_bytes());
    }

    #[test]
    fn handshake_round_trips_any_id() {
        for peer_id in [0, 1, 1001, u32::MAX, i32::MAX as u32] {
            let mut buf = encode_handshake(Handshake { peer_id });
            let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, Handshake { peer_id });
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn handshake_rejects_wrong_header() {
        let mut buf = encode_handshake(Handshake { peer_id: 1 });
        buf[0..18].copy_from_slice(b"WRONGHEADER......X");
        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(Error::InvalidHandshake)
        ));
    }

    #[test]
    fn handshake_ignores_padding_content() {
        let mut buf = encode_handshake(Handshake { peer_id: 7 });
        buf[20] = 0xff;
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.peer_id, 7);
    }

    #[test]
    fn handshake_waits_for_all_32_bytes() {
        let full = encode_handshake(Handshake { peer_id: 9 });
        let mut buf = BytesMut::from(&full[..31]);
        assert_eq!(HandshakeCodec.decode(&mut buf).unwrap(), None);
        buf.put_u8(full[31]);
        assert!(HandshakeCodec.decode(&mut buf).unwrap().is_some());
    }

    fn round_trip(msg: Message) {
        let mut codec = MessageCodec::new(100);
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        // length prefix counts the type byte plus payload
        let declared = u32::from_be_bytes(buf[..4].try_into().unwrap());
        assert_eq!(declared as usize, buf.len() - 4);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn messages_round_trip() {
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
        round_trip(Message::Have(42));
        round_trip(Message::Bitfield(vec![0x90, 0x20]));
        round_trip(Message::Request(3));
        round_trip(Message::Piece {
            index: 2,
            data: (0u8..100).collect(),
        });
    }

    #[test]
    fn rejects_zero_length_frames() {
        let mut codec = MessageCodec::new(100);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::InvalidMessageLength(0))
        ));
    }

    #[test]
    fn rejects_unknown_message_types() {
        let mut codec = MessageCodec::new(100);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 8][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::UnknownMessageType(8))
        ));
    }

    #[test]
    fn rejects_oversized_frames() {
        let mut codec = MessageCodec::new(100);
        let mut buf = BytesMut::new();
        buf.put_u32(1 + 4 + 101);
        buf.put_u8(MSG_PIECE);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::InvalidMessageLength(_))
        ));
    }

    #[test]
    fn rejects_mismatched_payload_lengths() {
        let mut codec = MessageCodec::new(100);
        // a choke with a stray payload byte
        let mut buf = BytesMut::from(&[0u8, 0, 0, 2, MSG_CHOKE, 0xee][..]);
        assert!(codec.decode(&mut buf).is_err());
        // a have with a short index
        let mut buf = BytesMut::from(&[0u8, 0, 0, 3, MSG_HAVE, 0, 1][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn decodes_incrementally_across_split_buffers() {
        let mut codec = MessageCodec::new(100);
        let mut wire = BytesMut::new();
        codec.encode(Message::Have(5), &mut wire).unwrap();
        codec.encode(Message::Request(6), &mut wire).unwrap();

        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for &byte in wire.iter() {
            buf.put_u8(byte);
            if let Some(msg) = codec.decode(&mut buf).unwrap() {
                decoded.push(msg);
            }
        }
        assert_eq!(decoded, vec![Message::Have(5), Message::Request(6)]);
    }
}
