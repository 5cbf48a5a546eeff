use super::multiplexer::{Command, Shared};
use mio::net::TcpStream;
use mio::Token;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Reacts to readiness of one connection.
///
/// Invoked at most once per loop iteration with the readable/writable
/// hints observed in that iteration. Returning an error forces the
/// connection closed.
pub trait ReadyListener: Send {
    fn ready(&self, conn: &Arc<Connection>, readable: bool, writable: bool) -> io::Result<()>;
}

impl<F> ReadyListener for F
where
    F: Fn(&Arc<Connection>, bool, bool) -> io::Result<()> + Send,
{
    fn ready(&self, conn: &Arc<Connection>, readable: bool, writable: bool) -> io::Result<()> {
        self(conn, readable, writable)
    }
}

/// Thin proxy over one socket owned by the multiplexer.
///
/// The multiplexer registers and deregisters the socket; the behavioral
/// response to readiness belongs to the listener installed after
/// accept/connect. Reads and writes pass straight through to the
/// non-blocking socket and may return partial counts.
pub struct Connection {
    token: Token,
    peer_addr: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
    listener: Mutex<Option<Box<dyn ReadyListener>>>,
    write_enabled: AtomicBool,
    ready_read: AtomicBool,
    ready_write: AtomicBool,
    closed: AtomicBool,
    shared: Arc<Shared>,
}

impl Connection {
    pub(super) fn new(token: Token, peer_addr: SocketAddr, shared: Arc<Shared>) -> Self {
        Self {
            token,
            peer_addr,
            stream: Mutex::new(None),
            listener: Mutex::new(None),
            write_enabled: AtomicBool::new(false),
            ready_read: AtomicBool::new(false),
            ready_write: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shared,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Installs the readiness listener. Set once, right after accept or
    /// connect completion, before any events can be delivered.
    pub fn set_ready_listener(&self, listener: Box<dyn ReadyListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    /// Non-blocking read; 0 means end-of-stream, `WouldBlock` means no
    /// bytes are currently available.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.lock().unwrap().as_mut() {
            Some(stream) => stream.read(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub fn read_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        match self.stream.lock().unwrap().as_mut() {
            Some(stream) => stream.read_vectored(bufs),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Non-blocking write; may accept only part of `buf`.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self.stream.lock().unwrap().as_mut() {
            Some(stream) => stream.write(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self.stream.lock().unwrap().as_mut() {
            Some(stream) => stream.write_vectored(bufs),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Requests or withdraws write-interest in the poll set.
    ///
    /// A no-op when the flag is unchanged; otherwise the change is queued
    /// to the loop thread, so it takes effect on the next iteration.
    pub fn set_write_enabled(self: &Arc<Self>, enabled: bool) {
        if self.write_enabled.swap(enabled, Ordering::AcqRel) == enabled {
            return;
        }
        self.shared.submit(Command::SetWriteInterest {
            conn: Arc::clone(self),
        });
    }

    pub fn write_enabled(&self) -> bool {
        self.write_enabled.load(Ordering::Acquire)
    }

    /// Closes the socket and clears the multiplexer's bookkeeping for it.
    /// Idempotent.
    pub fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.submit(Command::Close {
            conn: Arc::clone(self),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // Loop-thread plumbing below.

    pub(super) fn token(&self) -> Token {
        self.token
    }

    pub(super) fn install_stream(&self, stream: TcpStream) {
        *self.stream.lock().unwrap() = Some(stream);
    }

    pub(super) fn with_stream<R>(
        &self,
        f: impl FnOnce(&mut TcpStream) -> io::Result<R>,
    ) -> io::Result<R> {
        match self.stream.lock().unwrap().as_mut() {
            Some(stream) => f(stream),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub(super) fn take_stream(&self) -> Option<TcpStream> {
        self.stream.lock().unwrap().take()
    }

    pub(super) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Records readiness observed by the loop thread.
    pub(super) fn record_ready(&self, readable: bool, writable: bool) {
        if readable {
            self.ready_read.store(true, Ordering::Release);
        }
        if writable {
            self.ready_write.store(true, Ordering::Release);
        }
    }

    /// Consumes the recorded hints and notifies the listener once.
    pub(super) fn notify_ready(self: &Arc<Self>) -> io::Result<()> {
        let readable = self.ready_read.swap(false, Ordering::AcqRel);
        let writable = self.ready_write.swap(false, Ordering::AcqRel);
        if self.is_closed() || (!readable && !writable) {
            return Ok(());
        }
        let listener = self.listener.lock().unwrap();
        match listener.as_ref() {
            Some(listener) => listener.ready(self, readable, writable),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token.0)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
