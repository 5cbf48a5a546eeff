use thiserror::Error;

#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("engine has been shut down")]
    Shutdown,

    #[error("connection closed with {0} unparsed bytes buffered")]
    TruncatedStream(usize),

    #[error("unparsed buffer of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    #[error("invalid handshake")]
    InvalidHandshake,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("connect to {0} timed out")]
    ConnectTimeout(std::net::SocketAddr),

    #[error("extension error: {0}")]
    ExtensionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SwarmError>;
