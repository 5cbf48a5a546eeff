use crate::error::{Result, SwarmError};
use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

const EXTENSION_PROTOCOL_BIT: (usize, u8) = (5, 0x10);
const FAST_EXTENSION_BIT: (usize, u8) = (7, 0x04);

/// Pre-framing handshake, fixed 68 bytes:
/// protocol-name length + protocol name + 8 reserved/capability bytes +
/// 20-byte content identifier + 20-byte peer identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    /// Builds an outgoing handshake advertising the extension framework
    /// and the fast extension.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_PROTOCOL_BIT.0] |= EXTENSION_PROTOCOL_BIT.1;
        reserved[FAST_EXTENSION_BIT.0] |= FAST_EXTENSION_BIT.1;
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    /// Content identifier as lowercase hex, for logs and diagnostics.
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[EXTENSION_PROTOCOL_BIT.0] & EXTENSION_PROTOCOL_BIT.1 != 0
    }

    pub fn supports_fast_extension(&self) -> bool {
        self.reserved[FAST_EXTENSION_BIT.0] & FAST_EXTENSION_BIT.1 != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HANDSHAKE_LEN {
            return Err(SwarmError::InvalidHandshake);
        }
        if data[0] as usize != PROTOCOL_STRING.len() || &data[1..20] != PROTOCOL_STRING {
            return Err(SwarmError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

/// Generates a peer identifier with a client prefix and random tail.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(b"-PS0100-");
    rand::thread_rng().fill(&mut peer_id[8..]);
    peer_id
}
