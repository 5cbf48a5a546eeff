use super::connection::Connection;
use crate::config::EngineConfig;
use crate::error::{Result, SwarmError};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const WAKER_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;

/// Receives connections accepted on a listening socket.
pub trait AcceptListener: Send {
    fn accepted(&self, conn: Arc<Connection>);
}

impl<F: Fn(Arc<Connection>) + Send> AcceptListener for F {
    fn accepted(&self, conn: Arc<Connection>) {
        self(conn)
    }
}

/// Receives the outcome of an outbound connect.
pub trait ConnectListener: Send {
    fn connected(&self, conn: &Arc<Connection>);
    fn connect_failed(&self, addr: SocketAddr, error: io::Error);
}

/// Cross-thread mutation requests, drained once per loop iteration.
///
/// This queue plus the waker is the only path by which threads other than
/// the loop thread affect the poll set.
pub(super) enum Command {
    Listen {
        listener: TcpListener,
        accept: Box<dyn AcceptListener>,
    },
    Connect {
        conn: Arc<Connection>,
        on_connect: Box<dyn ConnectListener>,
        deadline: Option<Instant>,
    },
    SetWriteInterest {
        conn: Arc<Connection>,
    },
    Close {
        conn: Arc<Connection>,
    },
}

pub(super) struct Shared {
    commands: Mutex<VecDeque<Command>>,
    waker: Waker,
    shutdown: AtomicBool,
    next_token: AtomicUsize,
}

impl Shared {
    /// Enqueues a command and wakes the blocking poll call; without the
    /// wake-up the command would sit until the poll timeout fires.
    pub(super) fn submit(&self, command: Command) {
        self.commands.lock().unwrap().push_back(command);
        if let Err(error) = self.waker.wake() {
            warn!("failed to wake poll loop: {}", error);
        }
    }

    fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Single-thread socket multiplexer.
///
/// Exactly one thread runs the poll loop and performs all socket I/O
/// registration. Other threads interact through `listen`, `connect`,
/// `Connection::set_write_enabled` and `close`, all of which enqueue a
/// command and wake the loop. Only `close` blocks the caller.
pub struct Multiplexer {
    shared: Arc<Shared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Multiplexer {
    /// Spawns the selector thread and returns the handle other threads use.
    pub fn start(config: &EngineConfig) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let shared = Arc::new(Shared {
            commands: Mutex::new(VecDeque::new()),
            waker,
            shutdown: AtomicBool::new(false),
            next_token: AtomicUsize::new(WAKER_TOKEN.0 + 1),
        });

        let event_loop = EventLoop {
            poll,
            shared: Arc::clone(&shared),
            poll_interval: config.poll_interval,
            servers: HashMap::new(),
            connections: HashMap::new(),
            pending: HashMap::new(),
        };
        let join = std::thread::Builder::new()
            .name("peerswarm-net".into())
            .spawn(move || event_loop.run())
            .map_err(SwarmError::IoError)?;

        Ok(Self {
            shared,
            join: Mutex::new(Some(join)),
        })
    }

    /// Binds a server socket and registers it for accept events.
    ///
    /// Binding happens on the calling thread so the resolved port (for
    /// `port == 0`) is returned synchronously; registration is deferred to
    /// the next loop iteration.
    pub fn listen(
        &self,
        addr: IpAddr,
        port: u16,
        accept: Box<dyn AcceptListener>,
    ) -> Result<u16> {
        if self.shared.is_shutdown() {
            return Err(SwarmError::Shutdown);
        }
        let listener = TcpListener::bind(SocketAddr::new(addr, port))?;
        let bound_port = listener.local_addr()?.port();
        info!(%addr, bound_port, "listening for inbound connections");
        self.shared.submit(Command::Listen { listener, accept });
        Ok(bound_port)
    }

    /// Starts an outbound connect.
    ///
    /// The connection object is returned synchronously; the non-blocking
    /// `connect()` and selector registration run on the loop's next
    /// iteration. A zero `timeout` waits indefinitely, anything else is a
    /// deadline checked once per iteration.
    pub fn connect(
        &self,
        addr: SocketAddr,
        on_connect: Box<dyn ConnectListener>,
        timeout: Duration,
    ) -> Result<Arc<Connection>> {
        if self.shared.is_shutdown() {
            return Err(SwarmError::Shutdown);
        }
        let conn = Arc::new(Connection::new(
            self.shared.next_token(),
            addr,
            Arc::clone(&self.shared),
        ));
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        debug!(%addr, ?timeout, "outbound connect queued");
        self.shared.submit(Command::Connect {
            conn: Arc::clone(&conn),
            on_connect,
            deadline,
        });
        Ok(conn)
    }

    /// Shuts the engine down: sets the flag, wakes the loop, and blocks
    /// until the loop thread has closed every channel and exited.
    /// Idempotent.
    pub fn close(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Err(error) = self.shared.waker.wake() {
            warn!("failed to wake poll loop for shutdown: {}", error);
        }
        if let Some(join) = self.join.lock().unwrap().take() {
            if join.join().is_err() {
                warn!("poll loop thread panicked");
            }
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.close();
    }
}

struct ServerEntry {
    listener: TcpListener,
    accept: Box<dyn AcceptListener>,
}

struct PendingConnect {
    conn: Arc<Connection>,
    on_connect: Box<dyn ConnectListener>,
    deadline: Option<Instant>,
}

struct EventLoop {
    poll: Poll,
    shared: Arc<Shared>,
    poll_interval: Duration,
    servers: HashMap<Token, ServerEntry>,
    connections: HashMap<Token, Arc<Connection>>,
    pending: HashMap<Token, PendingConnect>,
}

impl EventLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            // Fixed per-iteration order: shutdown check, deadline expiry,
            // queued mutations, poll, dispatch, listener notification.
            if self.shared.is_shutdown() {
                self.shutdown();
                return;
            }
            self.expire_deadlines();
            self.drain_commands();

            if let Err(error) = self.poll.poll(&mut events, Some(self.poll_interval)) {
                if error.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("poll failed: {}", error);
                continue;
            }

            let mut ready: Vec<Token> = Vec::new();
            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                if self.servers.contains_key(&token) {
                    self.accept_ready(token);
                } else if self.pending.contains_key(&token) {
                    self.finish_connect(token);
                } else if let Some(conn) = self.connections.get(&token) {
                    conn.record_ready(event.is_readable(), event.is_writable());
                    if !ready.contains(&token) {
                        ready.push(token);
                    }
                }
            }

            // Each connection that became ready this iteration is notified
            // exactly once, with both hints folded into the one call.
            for token in ready {
                let Some(conn) = self.connections.get(&token).cloned() else {
                    continue;
                };
                if let Err(error) = conn.notify_ready() {
                    warn!(peer = %conn.peer_addr(), "connection listener failed: {}", error);
                    self.drop_connection(&conn);
                }
            }
        }
    }

    fn expire_deadlines(&mut self) {
        let now = Instant::now();
        let expired: Vec<Token> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline.is_some_and(|deadline| now >= deadline))
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            let pending = self.pending.remove(&token).expect("expired token present");
            let addr = pending.conn.peer_addr();
            debug!(%addr, "outbound connect deadline expired");
            self.discard_stream(&pending.conn);
            pending
                .on_connect
                .connect_failed(addr, io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
        }
    }

    fn drain_commands(&mut self) {
        let drained: VecDeque<Command> =
            std::mem::take(&mut *self.shared.commands.lock().unwrap());
        for command in drained {
            match command {
                Command::Listen {
                    mut listener,
                    accept,
                } => {
                    let token = self.shared.next_token();
                    if let Err(error) =
                        self.poll
                            .registry()
                            .register(&mut listener, token, Interest::READABLE)
                    {
                        warn!("failed to register server socket: {}", error);
                        continue;
                    }
                    self.servers.insert(token, ServerEntry { listener, accept });
                }
                Command::Connect {
                    conn,
                    on_connect,
                    deadline,
                } => {
                    let addr = conn.peer_addr();
                    let mut stream = match TcpStream::connect(addr) {
                        Ok(stream) => stream,
                        Err(error) => {
                            conn.mark_closed();
                            on_connect.connect_failed(addr, error);
                            continue;
                        }
                    };
                    if let Err(error) =
                        self.poll
                            .registry()
                            .register(&mut stream, conn.token(), Interest::WRITABLE)
                    {
                        conn.mark_closed();
                        on_connect.connect_failed(addr, error);
                        continue;
                    }
                    conn.install_stream(stream);
                    self.pending.insert(
                        conn.token(),
                        PendingConnect {
                            conn,
                            on_connect,
                            deadline,
                        },
                    );
                }
                Command::SetWriteInterest { conn } => {
                    // Redundant toggles collapse here: the current flag is
                    // read at processing time, not at submission time.
                    if self.connections.contains_key(&conn.token()) {
                        if let Err(error) = self.reregister(&conn) {
                            warn!(peer = %conn.peer_addr(), "reregister failed: {}", error);
                            self.drop_connection(&conn);
                        }
                    }
                }
                Command::Close { conn } => {
                    self.drop_connection(&conn);
                }
            }
        }
    }

    fn accept_ready(&mut self, token: Token) {
        loop {
            let entry = self.servers.get_mut(&token).expect("server token present");
            match entry.listener.accept() {
                Ok((mut stream, addr)) => {
                    let conn_token = self.shared.next_token();
                    if let Err(error) =
                        self.poll
                            .registry()
                            .register(&mut stream, conn_token, Interest::READABLE)
                    {
                        warn!(%addr, "failed to register accepted socket: {}", error);
                        continue;
                    }
                    let conn = Arc::new(Connection::new(
                        conn_token,
                        addr,
                        Arc::clone(&self.shared),
                    ));
                    conn.install_stream(stream);
                    self.connections.insert(conn_token, Arc::clone(&conn));
                    debug!(%addr, "inbound connection accepted");
                    entry.accept.accepted(conn);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    warn!("accept failed: {}", error);
                    break;
                }
            }
        }
    }

    fn finish_connect(&mut self, token: Token) {
        let outcome = {
            let pending = self.pending.get(&token).expect("pending token present");
            pending.conn.with_stream(|stream| {
                if let Some(error) = stream.take_error()? {
                    return Err(error);
                }
                match stream.peer_addr() {
                    Ok(_) => Ok(true),
                    Err(error)
                        if error.kind() == io::ErrorKind::NotConnected
                            || error.kind() == io::ErrorKind::WouldBlock =>
                    {
                        Ok(false)
                    }
                    Err(error) => Err(error),
                }
            })
        };

        match outcome {
            Ok(false) => {} // spurious wakeup, still connecting
            Ok(true) => {
                let pending = self.pending.remove(&token).expect("pending token present");
                if let Err(error) = self.reregister(&pending.conn) {
                    let addr = pending.conn.peer_addr();
                    self.discard_stream(&pending.conn);
                    pending.on_connect.connect_failed(addr, error);
                    return;
                }
                self.connections.insert(token, Arc::clone(&pending.conn));
                debug!(peer = %pending.conn.peer_addr(), "outbound connection established");
                pending.on_connect.connected(&pending.conn);
            }
            Err(error) => {
                let pending = self.pending.remove(&token).expect("pending token present");
                let addr = pending.conn.peer_addr();
                debug!(%addr, "outbound connect failed: {}", error);
                self.discard_stream(&pending.conn);
                pending.on_connect.connect_failed(addr, error);
            }
        }
    }

    fn reregister(&self, conn: &Arc<Connection>) -> io::Result<()> {
        let interest = if conn.write_enabled() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        conn.with_stream(|stream| self.poll.registry().reregister(stream, conn.token(), interest))
    }

    /// Removes a connection from every tracking structure and closes the
    /// socket. Safe to call for tokens that were already cleaned up.
    fn drop_connection(&mut self, conn: &Arc<Connection>) {
        let token = conn.token();
        self.pending.remove(&token);
        self.connections.remove(&token);
        self.discard_stream(conn);
    }

    fn discard_stream(&self, conn: &Arc<Connection>) {
        conn.mark_closed();
        if let Some(mut stream) = conn.take_stream() {
            let _ = self.poll.registry().deregister(&mut stream);
        }
    }

    fn shutdown(mut self) {
        for (_, pending) in self.pending.drain() {
            let addr = pending.conn.peer_addr();
            pending.conn.mark_closed();
            if let Some(mut stream) = pending.conn.take_stream() {
                let _ = self.poll.registry().deregister(&mut stream);
            }
            pending.on_connect.connect_failed(
                addr,
                io::Error::new(io::ErrorKind::Interrupted, "engine shutdown"),
            );
        }
        for (_, conn) in self.connections.drain() {
            conn.mark_closed();
            if let Some(mut stream) = conn.take_stream() {
                let _ = self.poll.registry().deregister(&mut stream);
            }
        }
        self.servers.clear();
        info!("multiplexer loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::ReadyListener;
    use std::sync::mpsc;

    fn config() -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_millis(20),
            ..EngineConfig::default()
        }
    }

    struct ChannelConnect {
        tx: mpsc::Sender<std::result::Result<Arc<Connection>, io::Error>>,
    }

    impl ConnectListener for ChannelConnect {
        fn connected(&self, conn: &Arc<Connection>) {
            let _ = self.tx.send(Ok(Arc::clone(conn)));
        }

        fn connect_failed(&self, _addr: SocketAddr, error: io::Error) {
            let _ = self.tx.send(Err(error));
        }
    }

    struct EchoBytes {
        tx: mpsc::Sender<Vec<u8>>,
    }

    impl ReadyListener for EchoBytes {
        fn ready(&self, conn: &Arc<Connection>, readable: bool, _writable: bool) -> io::Result<()> {
            if !readable {
                return Ok(());
            }
            let mut buf = [0u8; 4096];
            loop {
                match conn.read(&mut buf) {
                    Ok(0) => return Ok(()),
                    Ok(n) => {
                        let _ = self.tx.send(buf[..n].to_vec());
                    }
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(error) => return Err(error),
                }
            }
        }
    }

    #[test]
    fn loopback_connect_accept_and_read() {
        let mux = Multiplexer::start(&config()).unwrap();

        let (accept_tx, accept_rx) = mpsc::channel::<Vec<u8>>();
        let port = mux
            .listen(
                IpAddr::from([127, 0, 0, 1]),
                0,
                Box::new(move |conn: Arc<Connection>| {
                    conn.set_ready_listener(Box::new(EchoBytes {
                        tx: accept_tx.clone(),
                    }));
                }),
            )
            .unwrap();
        assert_ne!(port, 0);

        let (tx, rx) = mpsc::channel();
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        mux.connect(addr, Box::new(ChannelConnect { tx }), Duration::from_secs(5))
            .unwrap();

        let conn = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("connect outcome")
            .expect("connect succeeded");
        assert_eq!(conn.peer_addr(), addr);

        conn.write(b"hello swarm").unwrap();
        let received = accept_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("server read");
        assert_eq!(received, b"hello swarm");

        mux.close();
    }

    #[test]
    fn connect_timeout_fires_no_sooner_than_the_deadline() {
        let mux = Multiplexer::start(&config()).unwrap();
        let (tx, rx) = mpsc::channel();
        // RFC 5737 TEST-NET address: not routable, the connect just hangs.
        let addr = SocketAddr::from(([203, 0, 113, 1], 6881));
        let timeout = Duration::from_millis(250);

        let started = Instant::now();
        mux.connect(addr, Box::new(ChannelConnect { tx }), timeout)
            .unwrap();

        let outcome = rx.recv_timeout(Duration::from_secs(10)).expect("outcome");
        let elapsed = started.elapsed();
        let error = outcome.expect_err("connect must be rejected");
        if error.kind() != io::ErrorKind::TimedOut {
            // Some sandboxes reject unroutable addresses outright instead
            // of black-holing them; the deadline path cannot be observed.
            eprintln!("skipping deadline assertion, connect failed with {}", error);
            mux.close();
            return;
        }
        assert!(
            elapsed >= timeout,
            "rejected after {:?}, before the {:?} deadline",
            elapsed,
            timeout
        );

        mux.close();
    }

    #[test]
    fn write_interest_is_delivered_once_enabled() {
        let mux = Multiplexer::start(&config()).unwrap();

        let port = mux
            .listen(
                IpAddr::from([127, 0, 0, 1]),
                0,
                Box::new(|_conn: Arc<Connection>| {}),
            )
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let conn = mux
            .connect(
                SocketAddr::from(([127, 0, 0, 1], port)),
                Box::new(ChannelConnect { tx }),
                Duration::from_secs(5),
            )
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5))
            .expect("outcome")
            .expect("connected");

        let (ready_tx, ready_rx) = mpsc::channel();
        conn.set_ready_listener(Box::new(
            move |_conn: &Arc<Connection>, _readable: bool, writable: bool| -> io::Result<()> {
                if writable {
                    let _ = ready_tx.send(());
                }
                Ok(())
            },
        ));
        conn.set_write_enabled(true);
        ready_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("writable notification");

        // Unchanged flag: no queue traffic, call is a no-op.
        conn.set_write_enabled(true);

        mux.close();
    }

    #[test]
    fn close_is_idempotent_and_rejects_later_calls() {
        let mux = Multiplexer::start(&config()).unwrap();
        mux.close();
        mux.close();

        assert!(matches!(
            mux.listen(
                IpAddr::from([127, 0, 0, 1]),
                0,
                Box::new(|_conn: Arc<Connection>| {})
            ),
            Err(SwarmError::Shutdown)
        ));
        assert!(matches!(
            mux.connect(
                SocketAddr::from(([127, 0, 0, 1], 1)),
                Box::new(ChannelConnect {
                    tx: mpsc::channel().0
                }),
                Duration::ZERO,
            ),
            Err(SwarmError::Shutdown)
        ));
    }
}
