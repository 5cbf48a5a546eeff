//! Elastic sub-protocol frames.
//!
//! Mutable, append-only content rides the extension framework: pieces are
//! delivered together with the Merkle chain needed to check them against
//! the published root, new roots are announced as externally-signed views,
//! and bitfields are re-sent with an explicit bit length once the piece
//! count can grow past what the plain bitfield message assumed.

use super::message::BlockInfo;
use crate::error::{Result, SwarmError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Bytes in one Merkle chain node.
pub const HASH_LEN: usize = 20;

const KIND_HASH_PIECE: u8 = 1;
const KIND_SIGNED_VIEW: u8 = 2;
const KIND_BITFIELD_EXTENT: u8 = 3;

/// Frames of the elastic sub-protocol, carried as extended payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElasticMessage {
    /// Block delivery augmented with the hash chain from the block's leaf
    /// up to the announced root.
    HashPiece {
        block: BlockInfo,
        chain: Vec<[u8; HASH_LEN]>,
        data: Bytes,
    },
    /// Announcement of a grown view: the new piece count plus the root it
    /// hashes to, carrying an already-computed signature (verification is
    /// the embedder's concern, not this codec's).
    SignedView {
        piece_count: u32,
        root_hash: [u8; HASH_LEN],
        signature: Bytes,
    },
    /// Possession bitfield with an explicit bit length, replacing the
    /// fixed-length bitfield message once the view has grown.
    BitfieldExtent { length_bits: u32, bits: Bytes },
}

impl ElasticMessage {
    /// Builds a hash-piece frame, rejecting a payload whose length
    /// disagrees with the descriptor.
    pub fn hash_piece(block: BlockInfo, chain: Vec<[u8; HASH_LEN]>, data: Bytes) -> Result<Self> {
        if data.len() != block.length as usize {
            return Err(SwarmError::InvalidArgument(format!(
                "hash piece payload is {} bytes but the block declares {}",
                data.len(),
                block.length
            )));
        }
        Ok(ElasticMessage::HashPiece { block, chain, data })
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            ElasticMessage::HashPiece { block, chain, data } => {
                if data.len() != block.length as usize {
                    return Err(SwarmError::InvalidArgument(format!(
                        "hash piece payload is {} bytes but the block declares {}",
                        data.len(),
                        block.length
                    )));
                }
                buf.put_u8(KIND_HASH_PIECE);
                buf.put_u32(block.piece_index);
                buf.put_u32(block.offset);
                buf.put_u16(chain.len() as u16);
                for node in chain {
                    buf.put_slice(node);
                }
                buf.put_slice(data);
            }
            ElasticMessage::SignedView {
                piece_count,
                root_hash,
                signature,
            } => {
                buf.put_u8(KIND_SIGNED_VIEW);
                buf.put_u32(*piece_count);
                buf.put_slice(root_hash);
                buf.put_u16(signature.len() as u16);
                buf.put_slice(signature);
            }
            ElasticMessage::BitfieldExtent { length_bits, bits } => {
                buf.put_u8(KIND_BITFIELD_EXTENT);
                buf.put_u32(*length_bits);
                buf.put_slice(bits);
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.is_empty() {
            return Err(SwarmError::MalformedFrame("empty elastic frame".into()));
        }
        let kind = payload.get_u8();
        match kind {
            KIND_HASH_PIECE => {
                if payload.remaining() < 10 {
                    return Err(SwarmError::MalformedFrame("hash piece too short".into()));
                }
                let piece_index = payload.get_u32();
                let offset = payload.get_u32();
                let chain_len = payload.get_u16() as usize;
                if payload.remaining() < chain_len * HASH_LEN {
                    return Err(SwarmError::MalformedFrame("hash chain too short".into()));
                }
                let mut chain = Vec::with_capacity(chain_len);
                for _ in 0..chain_len {
                    let mut node = [0u8; HASH_LEN];
                    payload.copy_to_slice(&mut node);
                    chain.push(node);
                }
                let data = payload;
                let block = BlockInfo::new(piece_index, offset, data.len() as u32);
                Ok(ElasticMessage::HashPiece { block, chain, data })
            }
            KIND_SIGNED_VIEW => {
                if payload.remaining() < 4 + HASH_LEN + 2 {
                    return Err(SwarmError::MalformedFrame("signed view too short".into()));
                }
                let piece_count = payload.get_u32();
                let mut root_hash = [0u8; HASH_LEN];
                payload.copy_to_slice(&mut root_hash);
                let sig_len = payload.get_u16() as usize;
                if payload.remaining() < sig_len {
                    return Err(SwarmError::MalformedFrame("signature too short".into()));
                }
                let signature = payload.copy_to_bytes(sig_len);
                Ok(ElasticMessage::SignedView {
                    piece_count,
                    root_hash,
                    signature,
                })
            }
            KIND_BITFIELD_EXTENT => {
                if payload.remaining() < 4 {
                    return Err(SwarmError::MalformedFrame("bitfield extent too short".into()));
                }
                let length_bits = payload.get_u32();
                if payload.remaining() * 8 < length_bits as usize {
                    return Err(SwarmError::MalformedFrame(
                        "bitfield extent shorter than its declared bit length".into(),
                    ));
                }
                Ok(ElasticMessage::BitfieldExtent {
                    length_bits,
                    bits: payload,
                })
            }
            other => Err(SwarmError::MalformedFrame(format!(
                "unknown elastic frame kind {}",
                other
            ))),
        }
    }
}
