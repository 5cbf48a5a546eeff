use crate::error::{Result, SwarmError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Identifies a byte range within one piece.
///
/// The unit of request and response on the wire, and the key for
/// outstanding-request tracking in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece_index: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockInfo {
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }
}

/// Message type IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    // Fast extension
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    // Extension framework
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = SwarmError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            13 => Ok(MessageId::Suggest),
            14 => Ok(MessageId::HaveAll),
            15 => Ok(MessageId::HaveNone),
            16 => Ok(MessageId::Reject),
            17 => Ok(MessageId::AllowedFast),
            20 => Ok(MessageId::Extended),
            _ => Err(SwarmError::UnknownMessageId(value)),
        }
    }
}

/// Messages exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Keep-alive (no payload).
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Possession of one piece.
    Have { piece: u32 },
    /// Possession bitfield, raw wire bytes.
    Bitfield(Bytes),
    /// Request one block.
    Request { block: BlockInfo },
    /// Deliver one block.
    Piece { block: BlockInfo, data: Bytes },
    /// Withdraw a pending request.
    Cancel { block: BlockInfo },
    /// Fast extension: hint at a piece worth requesting.
    Suggest { piece: u32 },
    /// Fast extension: possession of every piece, replaces the bitfield.
    HaveAll,
    /// Fast extension: possession of no pieces, replaces the bitfield.
    HaveNone,
    /// Fast extension: refusal of one request.
    Reject { block: BlockInfo },
    /// Fast extension: piece requestable even while choked.
    AllowedFast { piece: u32 },
    /// Extension framework envelope: sub-ID 0 is the extended handshake,
    /// anything above is dispatched through the registry.
    Extended { id: u8, payload: Bytes },
}

impl Message {
    /// Builds a piece message, rejecting a payload whose length disagrees
    /// with the descriptor.
    pub fn piece(block: BlockInfo, data: Bytes) -> Result<Self> {
        if data.len() != block.length as usize {
            return Err(SwarmError::InvalidArgument(format!(
                "piece payload is {} bytes but the block declares {}",
                data.len(),
                block.length
            )));
        }
        Ok(Message::Piece { block, data })
    }

    /// Serializes to the length-prefixed wire frame.
    ///
    /// The only failing case is a piece message whose data length does not
    /// match its block descriptor; nothing is written in that case.
    pub fn encode(&self) -> Result<Bytes> {
        if let Message::Piece { block, data } = self {
            if data.len() != block.length as usize {
                return Err(SwarmError::InvalidArgument(format!(
                    "piece payload is {} bytes but the block declares {}",
                    data.len(),
                    block.length
                )));
            }
        }

        let mut buf = BytesMut::new();
        match self {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => put_bare(&mut buf, MessageId::Choke),
            Message::Unchoke => put_bare(&mut buf, MessageId::Unchoke),
            Message::Interested => put_bare(&mut buf, MessageId::Interested),
            Message::NotInterested => put_bare(&mut buf, MessageId::NotInterested),
            Message::Have { piece } => put_piece_index(&mut buf, MessageId::Have, *piece),
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request { block } => put_block(&mut buf, MessageId::Request, block),
            Message::Piece { block, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(block.piece_index);
                buf.put_u32(block.offset);
                buf.put_slice(data);
            }
            Message::Cancel { block } => put_block(&mut buf, MessageId::Cancel, block),
            Message::Suggest { piece } => put_piece_index(&mut buf, MessageId::Suggest, *piece),
            Message::HaveAll => put_bare(&mut buf, MessageId::HaveAll),
            Message::HaveNone => put_bare(&mut buf, MessageId::HaveNone),
            Message::Reject { block } => put_block(&mut buf, MessageId::Reject, block),
            Message::AllowedFast { piece } => {
                put_piece_index(&mut buf, MessageId::AllowedFast, *piece)
            }
            Message::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }
        Ok(buf.freeze())
    }

    /// Deserializes one full frame, length prefix included.
    pub fn decode(mut frame: Bytes) -> Result<Self> {
        if frame.len() < 4 {
            return Err(SwarmError::MalformedFrame("frame shorter than prefix".into()));
        }
        let length = frame.get_u32() as usize;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if frame.remaining() < length {
            return Err(SwarmError::MalformedFrame("frame shorter than declared".into()));
        }
        Self::decode_payload(frame.copy_to_bytes(length))
    }

    /// Deserializes a frame payload (the bytes after the length prefix).
    pub fn decode_payload(mut payload: Bytes) -> Result<Self> {
        if payload.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let id = MessageId::try_from(payload.get_u8())?;

        match id {
            MessageId::Choke => expect_empty(payload, Message::Choke),
            MessageId::Unchoke => expect_empty(payload, Message::Unchoke),
            MessageId::Interested => expect_empty(payload, Message::Interested),
            MessageId::NotInterested => expect_empty(payload, Message::NotInterested),
            MessageId::Have => Ok(Message::Have {
                piece: get_u32(&mut payload, "have")?,
            }),
            MessageId::Bitfield => Ok(Message::Bitfield(payload)),
            MessageId::Request => Ok(Message::Request {
                block: get_block(&mut payload, "request")?,
            }),
            MessageId::Piece => {
                if payload.remaining() < 8 {
                    return Err(SwarmError::MalformedFrame("piece too short".into()));
                }
                let piece_index = payload.get_u32();
                let offset = payload.get_u32();
                let data = payload;
                let block = BlockInfo::new(piece_index, offset, data.len() as u32);
                Ok(Message::Piece { block, data })
            }
            MessageId::Cancel => Ok(Message::Cancel {
                block: get_block(&mut payload, "cancel")?,
            }),
            MessageId::Suggest => Ok(Message::Suggest {
                piece: get_u32(&mut payload, "suggest")?,
            }),
            MessageId::HaveAll => expect_empty(payload, Message::HaveAll),
            MessageId::HaveNone => expect_empty(payload, Message::HaveNone),
            MessageId::Reject => Ok(Message::Reject {
                block: get_block(&mut payload, "reject")?,
            }),
            MessageId::AllowedFast => Ok(Message::AllowedFast {
                piece: get_u32(&mut payload, "allowed fast")?,
            }),
            MessageId::Extended => {
                if payload.remaining() < 1 {
                    return Err(SwarmError::MalformedFrame("extended too short".into()));
                }
                let id = payload.get_u8();
                Ok(Message::Extended { id, payload })
            }
        }
    }
}

fn put_bare(buf: &mut BytesMut, id: MessageId) {
    buf.put_u32(1);
    buf.put_u8(id as u8);
}

fn put_piece_index(buf: &mut BytesMut, id: MessageId, piece: u32) {
    buf.put_u32(5);
    buf.put_u8(id as u8);
    buf.put_u32(piece);
}

fn put_block(buf: &mut BytesMut, id: MessageId, block: &BlockInfo) {
    buf.put_u32(13);
    buf.put_u8(id as u8);
    buf.put_u32(block.piece_index);
    buf.put_u32(block.offset);
    buf.put_u32(block.length);
}

fn expect_empty(payload: Bytes, message: Message) -> Result<Message> {
    if !payload.is_empty() {
        return Err(SwarmError::MalformedFrame(format!(
            "{:?} carries {} unexpected payload bytes",
            message,
            payload.len()
        )));
    }
    Ok(message)
}

fn get_u32(payload: &mut Bytes, context: &str) -> Result<u32> {
    if payload.remaining() < 4 {
        return Err(SwarmError::MalformedFrame(format!("{context} too short")));
    }
    Ok(payload.get_u32())
}

fn get_block(payload: &mut Bytes, context: &str) -> Result<BlockInfo> {
    if payload.remaining() < 12 {
        return Err(SwarmError::MalformedFrame(format!("{context} too short")));
    }
    Ok(BlockInfo::new(
        payload.get_u32(),
        payload.get_u32(),
        payload.get_u32(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn roundtrip(message: Message) {
        let encoded = message.encode().unwrap();
        let decoded = Message::decode(encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn every_message_kind_roundtrips() {
        let block = BlockInfo::new(7, 16384, 16384);
        roundtrip(Message::KeepAlive);
        roundtrip(Message::Choke);
        roundtrip(Message::Unchoke);
        roundtrip(Message::Interested);
        roundtrip(Message::NotInterested);
        roundtrip(Message::Have { piece: 42 });
        roundtrip(Message::Bitfield(Bytes::from_static(&[0b1010_0000, 0x01])));
        roundtrip(Message::Request { block });
        roundtrip(Message::piece(BlockInfo::new(7, 0, 3), Bytes::from_static(b"abc")).unwrap());
        roundtrip(Message::Cancel { block });
        roundtrip(Message::Suggest { piece: 3 });
        roundtrip(Message::HaveAll);
        roundtrip(Message::HaveNone);
        roundtrip(Message::Reject { block });
        roundtrip(Message::AllowedFast { piece: 9 });
        roundtrip(Message::Extended {
            id: 2,
            payload: Bytes::from_static(b"\x01\x02\x03"),
        });
    }

    #[test]
    fn piece_length_mismatch_is_rejected() {
        let block = BlockInfo::new(0, 0, 10);
        assert_matches!(
            Message::piece(block, Bytes::from_static(b"short")),
            Err(SwarmError::InvalidArgument(_))
        );

        // A mismatched message constructed directly still refuses to encode.
        let message = Message::Piece {
            block,
            data: Bytes::from_static(b"short"),
        };
        assert_matches!(message.encode(), Err(SwarmError::InvalidArgument(_)));
    }

    #[test]
    fn unknown_id_is_distinguishable() {
        let frame = Bytes::from_static(&[0, 0, 0, 1, 99]);
        assert_matches!(Message::decode(frame), Err(SwarmError::UnknownMessageId(99)));
    }

    #[test]
    fn truncated_request_is_malformed() {
        let frame = Bytes::from_static(&[0, 0, 0, 5, 6, 0, 0, 0, 1]);
        assert_matches!(Message::decode(frame), Err(SwarmError::MalformedFrame(_)));
    }

    #[test]
    fn keep_alive_is_the_zero_length_frame() {
        let encoded = Message::KeepAlive.encode().unwrap();
        assert_eq!(&encoded[..], &[0, 0, 0, 0]);
    }
}
