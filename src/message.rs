use bytes::{Buf, BufMut, BytesMut};
use std::io::{Error, ErrorKind};
use tokio_util::codec::{Decoder, Encoder};

/// Peer-wire frames are `<length prefix><message id><payload>` with a
/// 4-byte big-endian length covering the id byte and payload. A length
/// of zero is a keep-alive and carries no id at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tag: MessageTag,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn interested() -> Self {
        Self {
            tag: MessageTag::Interested,
            payload: Vec::new(),
        }
    }

    pub fn request(index: u32, begin: u32, length: u32) -> Self {
        Self {
            tag: MessageTag::Request,
            payload: Request::new(index, begin, length).to_bytes().to_vec(),
        }
    }

    /// An extended message: one sub-id byte followed by its body.
    pub fn extended(ext_id: u8, body: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(1 + body.len());
        payload.push(ext_id);
        payload.extend_from_slice(body);
        Self {
            tag: MessageTag::Extended,
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MessageTag {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    // BEP 10 extension protocol
    Extended = 20,
}

impl TryFrom<u8> for MessageTag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MessageTag::*;
        match value {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Piece),
            8 => Ok(Cancel),
            20 => Ok(Extended),
            _ => Err(Error::new(
                ErrorKind::InvalidData,
                format!("unknown message id {value}"),
            )),
        }
    }
}

/// `request` payload: all three fields big-endian, 12 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl Request {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }

    pub fn to_bytes(self) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&self.index.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.begin.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    pub fn from_bytes(payload: &[u8]) -> Option<Self> {
        let bytes: [u8; 12] = payload.try_into().ok()?;
        Some(Self {
            index: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            begin: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            length: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
        })
    }
}

/// A view into a `piece` payload: `index:u32, begin:u32`, then the block
/// bytes from offset 8 onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block<'a> {
    pub index: u32,
    pub begin: u32,
    pub data: &'a [u8],
}

impl<'a> Block<'a> {
    pub fn from_payload(payload: &'a [u8]) -> Option<Self> {
        if payload.len() < 8 {
            return None;
        }
        Some(Self {
            index: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
            begin: u32::from_be_bytes(payload[4..8].try_into().unwrap()),
            data: &payload[8..],
        })
    }
}

pub struct MessageFramer;

// Largest frame a peer may send us. Big enough for a 16 KiB block plus
// its header, or a bitfield for half a million pieces.
const MAX_FRAME: usize = 1 << 16;

impl Decoder for MessageFramer {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < 4 {
                // Not enough data to read the length prefix.
                return Ok(None);
            }

            let mut length_bytes = [0u8; 4];
            length_bytes.copy_from_slice(&src[..4]);
            let length = u32::from_be_bytes(length_bytes) as usize;

            if length == 0 {
                // Keep-alive. Discard it and look for the next frame.
                src.advance(4);
                continue;
            }

            if length > MAX_FRAME {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("frame of length {length} is too large"),
                ));
            }

            if src.len() < 4 + length {
                // The full frame has not arrived yet. Reserving here is
                // not required for correctness but saves reallocations.
                src.reserve(4 + length - src.len());
                return Ok(None);
            }

            let tag = src[4].try_into()?;
            let payload = if length > 1 {
                src[5..4 + length].to_vec()
            } else {
                Vec::new()
            };
            src.advance(4 + length);

            return Ok(Some(Message { tag, payload }));
        }
    }
}

impl Encoder<Message> for MessageFramer {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // "+ 1" is the id byte.
        if item.payload.len() + 1 > MAX_FRAME {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("frame of length {} is too large", item.payload.len() + 1),
            ));
        }

        let length_slice = u32::to_be_bytes(item.payload.len() as u32 + 1);
        dst.reserve(4 + 1 + item.payload.len());
        dst.extend_from_slice(&length_slice);
        dst.put_u8(item.tag as u8);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_to_bytes(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        MessageFramer.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn frame_round_trip() {
        let original = Message::request(2, 16384, 9876);
        let mut buf = encode_to_bytes(original.clone());
        assert_eq!(&buf[..4], &13u32.to_be_bytes());
        let decoded = MessageFramer.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, original);
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_payload_round_trip() {
        let mut buf = encode_to_bytes(Message::interested());
        assert_eq!(&buf[..], &[0, 0, 0, 1, 2]);
        let decoded = MessageFramer.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.tag, MessageTag::Interested);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn decodes_streams_fed_byte_by_byte() {
        let messages = vec![
            Message {
                tag: MessageTag::Bitfield,
                payload: vec![0b1110_0000],
            },
            Message::interested(),
            Message::request(0, 0, 16384),
            Message {
                tag: MessageTag::Piece,
                payload: [&[0, 0, 0, 0, 0, 0, 64, 0][..], &[7u8; 100][..]].concat(),
            },
        ];
        let mut wire = BytesMut::new();
        for msg in &messages {
            MessageFramer.encode(msg.clone(), &mut wire).unwrap();
        }

        let mut decoder = MessageFramer;
        let mut partial = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in wire {
            partial.put_u8(byte);
            while let Some(msg) = decoder.decode(&mut partial).unwrap() {
                decoded.push(msg);
            }
        }
        assert_eq!(decoded, messages);
    }

    #[test]
    fn keep_alives_are_invisible() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&0u32.to_be_bytes());
        assert!(MessageFramer.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());

        // keep-alive wedged between two frames
        let mut buf = encode_to_bytes(Message::interested());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let mut second = encode_to_bytes(Message::request(1, 0, 16384));
        buf.unsplit(second.split());
        assert_eq!(
            MessageFramer.decode(&mut buf).unwrap().unwrap().tag,
            MessageTag::Interested
        );
        assert_eq!(
            MessageFramer.decode(&mut buf).unwrap().unwrap().tag,
            MessageTag::Request
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_unknown_ids_and_oversized_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 1, 9]);
        assert!(MessageFramer.decode(&mut buf).is_err());

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(MAX_FRAME as u32 + 1).to_be_bytes());
        buf.extend_from_slice(&[7]);
        assert!(MessageFramer.decode(&mut buf).is_err());
    }

    #[test]
    fn request_payload_layout() {
        let bytes = Request::new(1, 32768, 16384).to_bytes();
        assert_eq!(
            bytes,
            [0, 0, 0, 1, 0, 0, 0x80, 0, 0, 0, 0x40, 0]
        );
        assert_eq!(
            Request::from_bytes(&bytes),
            Some(Request::new(1, 32768, 16384))
        );
        assert_eq!(Request::from_bytes(&bytes[..11]), None);
    }

    #[test]
    fn block_starts_at_payload_offset_eight() {
        let payload = [&[0, 0, 0, 3, 0, 0, 0x40, 0][..], b"block data"].concat();
        let block = Block::from_payload(&payload).unwrap();
        assert_eq!(block.index, 3);
        assert_eq!(block.begin, 16384);
        assert_eq!(block.data, b"block data");
        assert!(Block::from_payload(&payload[..7]).is_none());
    }
}
