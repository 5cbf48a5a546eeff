//! Storage collaborator interface.
//!
//! Piece persistence and verification (hash, Merkle or elastic tree) live
//! outside this crate. The core only reads blocks to serve uploads,
//! writes received blocks, and asks for the content layout.

use crate::error::Result;
use crate::wire::BlockInfo;
use bytes::Bytes;

pub trait PieceStore: Send + Sync {
    /// Current number of pieces. May grow for elastic content.
    fn piece_count(&self) -> u32;

    /// Size in bytes of one piece; the last piece may be short.
    fn piece_size(&self, piece: u32) -> u32;

    /// Reads a verified block to serve an upload request.
    fn read_block(&self, block: &BlockInfo) -> Result<Bytes>;

    /// Persists a received block. Returns true once the enclosing piece
    /// has been verified against its expected hash.
    fn write_block(&self, block: &BlockInfo, data: &[u8]) -> Result<bool>;
}
