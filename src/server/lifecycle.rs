//! Connection lifecycle state machine.
//!
//! One `Lifecycle` owns the listening endpoint and at most one client
//! endpoint, and drives the full pass from listen through serving a single
//! client to full resource release. Every termination path (peer close,
//! accept/write failure, transport error) funnels through [`Lifecycle::finish`],
//! which runs exactly once per lifecycle and leaves both handles released.
//!
//! The state machine never blocks; it reacts to readiness delivered serially
//! by the event loop and issues non-blocking socket calls.

use crate::server::buffer::RecvBuffer;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Fixed greeting sent once to every client, before any read.
pub const GREETING: &[u8] = b"hello\n";

/// Receive buffer capacity; the last slot is reserved for the terminator.
pub const RECV_BUFFER_SIZE: usize = 2048;

/// Listener backlog. The server deliberately serves one client at a time.
const BACKLOG: i32 = 1;

pub const LISTENER: Token = Token(0);
pub const CLIENT: Token = Token(1);

/// Current phase of a lifecycle.
///
/// `Terminated` is never re-entered; the driver constructs a fresh
/// `Lifecycle` for each restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Listening,
    Connected,
    Closing,
    Terminated,
}

/// Terminal conditions of a lifecycle.
#[derive(Debug)]
pub enum LifecycleError {
    /// Socket or event loop allocation failed before listening.
    Create(io::Error),
    /// Could not bind the configured address.
    Bind(io::Error),
    /// Could not enter listening mode or arm the listener.
    Listen(io::Error),
    /// Accepting the client failed.
    Accept(io::Error),
    /// The greeting write was rejected by the transport.
    Write(io::Error),
    /// Asynchronous connection error, including abort-triggered variants.
    Transport(io::Error),
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::Create(e) => write!(f, "failed to create endpoint: {e}"),
            LifecycleError::Bind(e) => write!(f, "failed to bind: {e}"),
            LifecycleError::Listen(e) => write!(f, "failed to listen: {e}"),
            LifecycleError::Accept(e) => write!(f, "failed to accept client: {e}"),
            LifecycleError::Write(e) => write!(f, "failed to write greeting: {e}"),
            LifecycleError::Transport(e) => write!(f, "connection error: {e}"),
        }
    }
}

impl std::error::Error for LifecycleError {}

/// State for one serve-one-client pass.
pub struct Lifecycle {
    listener: Option<TcpListener>,
    client: Option<TcpStream>,
    phase: Phase,
    recv: RecvBuffer,
    /// Greeting bytes the transport has accepted so far.
    greeting_sent: usize,
    /// Received bytes acknowledged back to the peer's send window.
    bytes_acked: u64,
    done: bool,
    outcome: Option<Result<(), LifecycleError>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            listener: None,
            client: None,
            phase: Phase::Init,
            recv: RecvBuffer::new(RECV_BUFFER_SIZE),
            greeting_sent: 0,
            bytes_acked: 0,
            done: false,
            outcome: None,
        }
    }

    /// True once the terminal transition has run.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Result recorded by the terminal transition.
    pub fn take_outcome(&mut self) -> Option<Result<(), LifecycleError>> {
        self.outcome.take()
    }

    /// Create, bind, and start listening on `addr` with a backlog of 1.
    ///
    /// On failure the caller is expected to funnel the error through
    /// [`Lifecycle::finish`]; the lifecycle never reaches `Connected`.
    pub fn open(&mut self, registry: &Registry, addr: SocketAddr) -> Result<(), LifecycleError> {
        let socket = Socket::new(
            match addr {
                SocketAddr::V4(_) => Domain::IPV4,
                SocketAddr::V6(_) => Domain::IPV6,
            },
            Type::STREAM,
            Some(Protocol::TCP),
        )
        .map_err(LifecycleError::Create)?;

        socket
            .set_reuse_address(true)
            .map_err(LifecycleError::Create)?;
        socket
            .set_nonblocking(true)
            .map_err(LifecycleError::Create)?;
        socket.bind(&addr.into()).map_err(LifecycleError::Bind)?;
        socket.listen(BACKLOG).map_err(LifecycleError::Listen)?;

        let std_listener: std::net::TcpListener = socket.into();
        let mut listener = TcpListener::from_std(std_listener);
        registry
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(LifecycleError::Listen)?;

        let local = listener.local_addr().map_err(LifecycleError::Listen)?;
        info!(addr = %local, "server listening");

        self.listener = Some(listener);
        self.phase = Phase::Listening;
        Ok(())
    }

    /// Accept readiness on the listener.
    ///
    /// Accepts at most one client per lifecycle; readiness arriving after the
    /// client slot is taken is ignored until the lifecycle terminates.
    pub fn handle_acceptable(&mut self, registry: &Registry) {
        if self.done || self.phase != Phase::Listening {
            return;
        }

        let result = match self.listener.as_ref() {
            Some(listener) => listener.accept(),
            None => return,
        };

        match result {
            Ok((stream, peer)) => self.on_accept(registry, stream, peer),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => self.finish(registry, Err(LifecycleError::Accept(e))),
        }
    }

    /// Take ownership of the accepted client and immediately greet it.
    ///
    /// The server's only job per connection is "say hello, then listen", so
    /// the greeting write is issued from the accept path.
    fn on_accept(&mut self, registry: &Registry, mut stream: TcpStream, peer: SocketAddr) {
        info!(peer = %peer, "client connected");

        if let Err(e) = registry.register(&mut stream, CLIENT, Interest::READABLE) {
            self.client = Some(stream);
            self.finish(registry, Err(LifecycleError::Transport(e)));
            return;
        }

        self.client = Some(stream);
        self.phase = Phase::Connected;
        self.send_greeting(registry);
    }

    /// Start the greeting write from the beginning.
    fn send_greeting(&mut self, registry: &Registry) {
        self.greeting_sent = 0;
        debug!("writing greeting to client");
        self.flush_greeting(registry);
    }

    /// Write readiness on the client; resumes a partially sent greeting.
    pub fn handle_writable(&mut self, registry: &Registry) {
        if self.done || self.greeting_sent >= GREETING.len() {
            return;
        }
        self.flush_greeting(registry);
    }

    fn flush_greeting(&mut self, registry: &Registry) {
        while self.greeting_sent < GREETING.len() {
            let result = match self.client.as_mut() {
                Some(stream) => stream.write(&GREETING[self.greeting_sent..]),
                None => return,
            };

            match result {
                Ok(0) => {
                    let err = io::Error::new(io::ErrorKind::WriteZero, "write returned 0");
                    self.finish(registry, Err(LifecycleError::Write(err)));
                    return;
                }
                Ok(n) => self.on_sent(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Transport buffers are full; resume on writability
                    if let Some(stream) = self.client.as_mut() {
                        if let Err(e) = registry.reregister(
                            stream,
                            CLIENT,
                            Interest::READABLE | Interest::WRITABLE,
                        ) {
                            self.finish(registry, Err(LifecycleError::Transport(e)));
                        }
                    }
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.finish(registry, Err(LifecycleError::Write(e)));
                    return;
                }
            }
        }

        // Greeting fully handed to the transport; read interest only from here
        if let Some(stream) = self.client.as_mut() {
            if let Err(e) = registry.reregister(stream, CLIENT, Interest::READABLE) {
                self.finish(registry, Err(LifecycleError::Transport(e)));
            }
        }
    }

    /// Accumulate transport-acknowledged greeting bytes.
    ///
    /// Acknowledgment does not end the connection; only peer close, error, or
    /// an idle-timeout policy do.
    fn on_sent(&mut self, n: usize) {
        self.greeting_sent += n;
        debug!(bytes = n, total = self.greeting_sent, "greeting bytes sent");
        if self.greeting_sent >= GREETING.len() {
            debug!("greeting fully sent");
        }
    }

    /// Read readiness on the client. Drains until would-block.
    pub fn handle_readable(&mut self, registry: &Registry) {
        if self.done {
            return;
        }

        let mut chunk = [0u8; RECV_BUFFER_SIZE];
        loop {
            let result = match self.client.as_mut() {
                Some(stream) => stream.read(&mut chunk),
                None => return,
            };

            match result {
                Ok(0) => {
                    // Peer closed its sending side: clean completion
                    debug!("client closed the connection");
                    self.finish(registry, Ok(()));
                    return;
                }
                Ok(n) => self.on_receive(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.on_error(registry, e);
                    return;
                }
            }
        }
    }

    /// Log a received payload and acknowledge it to the transport.
    ///
    /// The copy into the buffer is clamped at `capacity - 1`; the
    /// acknowledged count is always the full received length so the peer's
    /// send window keeps advancing.
    fn on_receive(&mut self, payload: &[u8]) {
        let copied = self.recv.fill(payload);
        if copied < payload.len() {
            warn!(
                received = payload.len(),
                copied,
                capacity = self.recv.capacity(),
                "payload larger than buffer, truncating"
            );
        }
        self.bytes_acked += payload.len() as u64;
        info!(
            bytes = payload.len(),
            text = %String::from_utf8_lossy(self.recv.as_bytes()),
            "received from client"
        );
    }

    /// Idle heartbeat, fired when the poll step times out with a client
    /// connected. Deliberately a no-op; this is the extension point for an
    /// idle-timeout policy.
    pub fn on_poll(&self) {
        if self.phase == Phase::Connected {
            trace!("idle poll");
        }
    }

    /// Asynchronous connection error. Resets and aborted connections take the
    /// same terminal path as any other transport error.
    fn on_error(&mut self, registry: &Registry, err: io::Error) {
        self.finish(registry, Err(LifecycleError::Transport(err)));
    }

    /// The single terminal transition.
    ///
    /// All terminal conditions pass through here. Duplicate reports (e.g. an
    /// error event arriving after a clean close already ran) observe `done`
    /// and no-op, so cleanup runs exactly once per lifecycle.
    pub fn finish(&mut self, registry: &Registry, result: Result<(), LifecycleError>) {
        if self.done {
            return;
        }

        self.phase = Phase::Closing;
        match &result {
            Ok(()) => info!("connection completed normally"),
            Err(e) => error!(error = %e, "connection failed"),
        }

        self.done = true;
        self.close(registry);
        self.phase = Phase::Terminated;
        self.outcome = Some(result);
    }

    /// Idempotent resource release.
    ///
    /// Event delivery is disarmed before either handle is dropped, so no
    /// readiness can be dispatched against a half-released lifecycle. If the
    /// graceful close fails the connection is aborted instead (RST on drop).
    /// Calling this with both handles already absent is a no-op.
    pub fn close(&mut self, registry: &Registry) {
        if let Some(mut stream) = self.client.take() {
            let _ = registry.deregister(&mut stream);
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!(error = %e, "graceful close failed, aborting");
                abort(&stream);
            }
        }

        if let Some(mut listener) = self.listener.take() {
            let _ = registry.deregister(&mut listener);
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    #[cfg(test)]
    pub fn greeting_sent(&self) -> usize {
        self.greeting_sent
    }

    #[cfg(test)]
    pub fn bytes_acked(&self) -> u64 {
        self.bytes_acked
    }

    #[cfg(test)]
    pub fn received(&self) -> &[u8] {
        self.recv.as_bytes()
    }

    #[cfg(test)]
    pub fn handles_released(&self) -> bool {
        self.client.is_none() && self.listener.is_none()
    }
}

/// Arm an abortive close: the connection resets instead of lingering.
fn abort(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_linger(Some(Duration::from_secs(0))) {
        warn!(error = %e, "failed to arm abortive close");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_open_enters_listening() {
        let poll = Poll::new().unwrap();
        let mut lc = Lifecycle::new();

        lc.open(poll.registry(), loopback()).unwrap();
        assert_eq!(lc.phase(), Phase::Listening);
        assert!(lc.local_addr().is_some());
        assert!(!lc.is_done());
    }

    #[test]
    fn test_bind_error_when_port_taken() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let poll = Poll::new().unwrap();
        let mut lc = Lifecycle::new();
        let err = lc.open(poll.registry(), addr).unwrap_err();
        assert!(matches!(err, LifecycleError::Bind(_)));
        assert_eq!(lc.phase(), Phase::Init);

        // Setup failures funnel through the terminal path like any other
        lc.finish(poll.registry(), Err(err));
        assert!(lc.is_done());
        assert!(lc.handles_released());
        assert!(matches!(
            lc.take_outcome(),
            Some(Err(LifecycleError::Bind(_)))
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let poll = Poll::new().unwrap();
        let mut lc = Lifecycle::new();
        lc.open(poll.registry(), loopback()).unwrap();

        lc.close(poll.registry());
        assert!(lc.handles_released());

        // Second and third calls observe absent handles and no-op
        lc.close(poll.registry());
        lc.close(poll.registry());
        assert!(lc.handles_released());
    }

    #[test]
    fn test_finish_runs_once() {
        let poll = Poll::new().unwrap();
        let mut lc = Lifecycle::new();
        lc.open(poll.registry(), loopback()).unwrap();

        lc.finish(poll.registry(), Ok(()));
        assert!(lc.is_done());
        assert_eq!(lc.phase(), Phase::Terminated);

        // A racing terminal report must not overwrite the first outcome
        let late = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        lc.finish(poll.registry(), Err(LifecycleError::Transport(late)));
        assert!(matches!(lc.take_outcome(), Some(Ok(()))));
    }

    #[test]
    fn test_receive_logs_and_acks_exact_length() {
        let mut lc = Lifecycle::new();

        lc.on_receive(b"ping");
        assert_eq!(lc.bytes_acked(), 4);
        assert_eq!(lc.received(), b"ping");

        lc.on_receive(b"pong!");
        assert_eq!(lc.bytes_acked(), 9);
        assert_eq!(lc.received(), b"pong!");
    }

    #[test]
    fn test_receive_clamps_but_acks_full_length() {
        let mut lc = Lifecycle::new();
        let payload = vec![b'a'; RECV_BUFFER_SIZE + 1000];

        lc.on_receive(&payload);
        assert_eq!(lc.received().len(), RECV_BUFFER_SIZE - 1);
        assert_eq!(lc.bytes_acked(), payload.len() as u64);
    }
}
