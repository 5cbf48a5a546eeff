mod elastic;
mod extension;
mod fast;
mod handshake;
mod message;
mod parser;

pub use elastic::{ElasticMessage, HASH_LEN};
pub use extension::{
    ExtendedHandshake, ExtensionHandler, ExtensionRegistry, EXTENDED_HANDSHAKE_ID,
};
pub use fast::allowed_fast_set;
pub use handshake::{generate_peer_id, Handshake, HANDSHAKE_LEN, PROTOCOL_STRING};
pub use message::{BlockInfo, Message, MessageId};
pub use parser::FrameParser;
