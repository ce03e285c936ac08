//! Encodes and decodes the two frame types exchanged with a peer: the
//! fixed-length handshake, and the length-prefixed message stream that
//! follows it.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, Bitfield, BlockInfo, PeerId, Sha1Hash};

/// The protocol string sent in every handshake, as defined by the original
/// BitTorrent specification.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The fixed 68 byte handshake frame:
/// `pstrlen(1) || pstr(19) || reserved(8) || info_hash(20) || peer_id(20)`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self { prot, reserved: [0; 8], info_hash, peer_id }
    }
}

pub(crate) struct HandshakeCodec;

const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = std::io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = std::io::Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let pstrlen = buf[0] as usize;
        if pstrlen != 19 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid handshake protocol string length",
            ));
        }

        let mut bytes = buf.split_to(HANDSHAKE_LEN);
        bytes.advance(1);
        let mut prot = [0; 19];
        prot.copy_from_slice(&bytes[..19]);
        bytes.advance(19);
        let mut reserved = [0; 8];
        reserved.copy_from_slice(&bytes[..8]);
        bytes.advance(8);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&bytes[..20]);
        bytes.advance(20);
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&bytes[..20]);

        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid handshake protocol string",
            ));
        }

        Ok(Some(Handshake { prot, reserved, info_hash, peer_id }))
    }
}

/// The message ids of the peer wire protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

impl MessageId {
    /// Maps a raw wire id to a known message kind, or `None` if the id is
    /// not one this client understands.
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Block,
            8 => Self::Cancel,
            _ => return None,
        })
    }
}

/// A decoded peer wire protocol message.
#[derive(Debug)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: usize },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block { piece_index: usize, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

pub(crate) struct PeerCodec {
    /// The maximum accepted frame length; frames declaring a larger length
    /// are rejected without panicking.
    max_frame_len: u32,
}

impl PeerCodec {
    pub fn new(max_frame_len: u32) -> Self {
        Self { max_frame_len }
    }
}

impl Default for PeerCodec {
    fn default() -> Self {
        Self::new(1 << 20)
    }
}

fn encode_block_request(
    id: u8,
    block: &BlockInfo,
    buf: &mut BytesMut,
) {
    buf.put_u32(13);
    buf.put_u8(id);
    buf.put_u32(block.piece_index as u32);
    buf.put_u32(block.offset);
    buf.put_u32(block.len);
}

impl Encoder<Message> for PeerCodec {
    type Error = std::io::Error;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.as_raw_slice();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bytes);
            }
            Message::Request(block) => {
                encode_block_request(MessageId::Request as u8, &block, buf);
            }
            Message::Block { piece_index, offset, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Cancel(block) => {
                encode_block_request(MessageId::Cancel as u8, &block, buf);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut len_bytes = [0; 4];
        len_bytes.copy_from_slice(&buf[..4]);
        let len = u32::from_be_bytes(len_bytes);

        if len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if len > self.max_frame_len {
            // drop the whole buffer: we have no way to skip just this frame
            // without potentially desyncing the stream, but the session
            // closes on this error anyway
            buf.clear();
            return Err(Error::OversizedFrame(len));
        }

        if buf.len() < 4 + len as usize {
            buf.reserve(4 + len as usize - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let id = buf[0];
        let mut payload = buf.split_to(len as usize);
        payload.advance(1);

        let msg = match MessageId::from_u8(id) {
            Some(MessageId::Choke) => Message::Choke,
            Some(MessageId::Unchoke) => Message::Unchoke,
            Some(MessageId::Interested) => Message::Interested,
            Some(MessageId::NotInterested) => Message::NotInterested,
            Some(MessageId::Have) => {
                let piece_index = payload.get_u32() as usize;
                Message::Have { piece_index }
            }
            Some(MessageId::Bitfield) => {
                let bytes = payload.to_vec();
                Message::Bitfield(Bitfield::from_vec(bytes))
            }
            Some(MessageId::Request) => {
                let piece_index = payload.get_u32() as usize;
                let offset = payload.get_u32();
                let len = payload.get_u32();
                Message::Request(BlockInfo { piece_index, offset, len })
            }
            Some(MessageId::Block) => {
                let piece_index = payload.get_u32() as usize;
                let offset = payload.get_u32();
                let data = payload.to_vec();
                Message::Block { piece_index, offset, data }
            }
            Some(MessageId::Cancel) => {
                let piece_index = payload.get_u32() as usize;
                let offset = payload.get_u32();
                let len = payload.get_u32();
                Message::Cancel(BlockInfo { piece_index, offset, len })
            }
            None => {
                log::warn!("Received unknown peer message id {}", id);
                // the frame's bytes are already consumed above; keep
                // decoding in case another full frame is already buffered,
                // rather than returning `None` and waiting on more I/O
                return self.decode(buf);
            }
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let mut buf = BytesMut::new();
        let handshake = Handshake::new([3; 20], [9; 20]);
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.info_hash, [3; 20]);
        assert_eq!(decoded.peer_id, [9; 20]);
        assert_eq!(decoded.prot, PROTOCOL_STRING.as_bytes());
    }

    #[test]
    fn keep_alive_round_trips() {
        let mut buf = BytesMut::new();
        let mut codec = PeerCodec::default();
        codec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &0u32.to_be_bytes()[..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(msg, Message::KeepAlive));
    }

    #[test]
    fn request_round_trips() {
        let mut buf = BytesMut::new();
        let mut codec = PeerCodec::default();
        let block = BlockInfo { piece_index: 2, offset: 16384, len: 16384 };
        codec.encode(Message::Request(block), &mut buf).unwrap();
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        match msg {
            Message::Request(decoded) => assert_eq!(decoded, block),
            other => panic!("expected Request, got {:?}", other),
        }
    }

    #[test]
    fn oversized_frame_is_rejected_without_panicking() {
        let mut buf = BytesMut::new();
        let mut codec = PeerCodec::new(16);
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 100]);
        assert!(matches!(codec.decode(&mut buf), Err(Error::OversizedFrame(100))));
    }
}
