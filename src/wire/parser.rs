use super::message::Message;
use crate::error::{Result, SwarmError};
use bytes::{Buf, BytesMut};

/// Incremental frame parser.
///
/// Bytes arrive in arbitrary chunks from the non-blocking socket; the
/// parser buffers them and yields complete messages as they become
/// available. "Need more bytes" is not an error: [`FrameParser::next`]
/// returns `Ok(None)` and expects to be re-invoked after the next read.
///
/// Distinguishable failures:
/// - [`SwarmError::TruncatedStream`]: the connection reached end-of-stream
///   with a partial frame still buffered;
/// - [`SwarmError::FrameTooLarge`]: the unparsed buffer (or a declared
///   frame length) exceeds the configured cap, which is protocol abuse;
/// - [`SwarmError::MalformedFrame`] / [`SwarmError::UnknownMessageId`]:
///   bad leading bytes inside a complete frame.
#[derive(Debug)]
pub struct FrameParser {
    buf: BytesMut,
    max_frame: usize,
    eof: bool,
}

impl FrameParser {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame,
            eof: false,
        }
    }

    /// Appends raw bytes read from the socket.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buf.len() + bytes.len() > self.max_frame + 4 {
            return Err(SwarmError::FrameTooLarge {
                size: self.buf.len() + bytes.len(),
                limit: self.max_frame,
            });
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Marks that the underlying connection reached end-of-stream.
    pub fn mark_eof(&mut self) {
        self.eof = true;
    }

    /// Bytes buffered but not yet parsed into a message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Yields the next complete message, or `Ok(None)` while one is still
    /// being assembled.
    pub fn next(&mut self) -> Result<Option<Message>> {
        if self.buf.len() < 4 {
            return self.pending();
        }

        let declared = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
            as usize;
        if declared > self.max_frame {
            return Err(SwarmError::FrameTooLarge {
                size: declared,
                limit: self.max_frame,
            });
        }
        if self.buf.len() < 4 + declared {
            return self.pending();
        }

        self.buf.advance(4);
        let payload = self.buf.split_to(declared).freeze();
        Message::decode_payload(payload).map(Some)
    }

    fn pending(&self) -> Result<Option<Message>> {
        if self.eof && !self.buf.is_empty() {
            return Err(SwarmError::TruncatedStream(self.buf.len()));
        }
        Ok(None)
    }
}
