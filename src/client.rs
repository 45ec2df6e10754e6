//! Blocking-with-deadline client for one request/reply exchange.
//!
//! The socket itself is non-blocking; every wait goes through a private mio
//! poll bounded by whatever is left of the session's wait budget. The budget
//! starts when the connection is established and covers sending and
//! receiving together.
//!
//! ```ignore
//! let mut session = ClientSession::open("127.0.0.1", 9500, Duration::from_secs(30))?;
//! session.set_wait_budget(Duration::from_secs(10));
//! session.send_request(b"hello")?;
//! let reply = session.get_reply()?;
//! ```

use crate::clock::{Clock, Deadline, MonotonicClock};
use crate::error::{Error, Result};
use crate::protocol::{self, Decode};
use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, trace, warn};

const CLIENT_TOKEN: Token = Token(0);

/// Budget for a whole exchange unless changed with `set_wait_budget`.
pub const DEFAULT_WAIT_BUDGET: Duration = Duration::from_secs(300);

/// Default bound on establishing the connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Interrupted readiness waits tolerated while receiving.
const RECEIVE_WAIT_ATTEMPTS: usize = 10;

const READ_CHUNK: usize = 16 * 1024;

/// One outbound connection carrying a single request and its reply.
pub struct ClientSession<C = MonotonicClock> {
    /// `None` once closed.
    stream: Option<TcpStream>,
    poll: Poll,
    events: Events,
    interest: Interest,
    deadline: Deadline<C>,
    peer: SocketAddr,
    reply: BytesMut,
    malformed_logged: bool,
}

impl ClientSession<MonotonicClock> {
    /// Connect to `host:port`, giving up after `connect_timeout`.
    pub fn open(host: &str, port: u16, connect_timeout: Duration) -> Result<Self> {
        let stream = connect(host, port, connect_timeout).map_err(Error::Connect)?;
        Self::from_stream(stream, MonotonicClock::new())
    }
}

impl<C: Clock> ClientSession<C> {
    /// Like [`ClientSession::open`], measuring the budget with `clock`.
    pub fn open_with_clock(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        clock: C,
    ) -> Result<Self> {
        let stream = connect(host, port, connect_timeout).map_err(Error::Connect)?;
        Self::from_stream(stream, clock)
    }

    fn from_stream(stream: std::net::TcpStream, clock: C) -> Result<Self> {
        let peer = stream.peer_addr().map_err(Error::Connect)?;
        stream.set_nonblocking(true).map_err(Error::Connect)?;
        let mut stream = TcpStream::from_std(stream);

        let poll = Poll::new().map_err(Error::Io)?;
        let interest = Interest::WRITABLE;
        poll.registry()
            .register(&mut stream, CLIENT_TOKEN, interest)
            .map_err(Error::Io)?;

        debug!(peer = %peer, "Connected");

        Ok(Self {
            stream: Some(stream),
            poll,
            events: Events::with_capacity(4),
            interest,
            deadline: Deadline::new(clock, DEFAULT_WAIT_BUDGET),
            peer,
            reply: BytesMut::new(),
            malformed_logged: false,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn wait_budget(&self) -> Duration {
        self.deadline.budget()
    }

    /// Change the wait budget. Time spent since `open` still counts.
    pub fn set_wait_budget(&mut self, budget: Duration) {
        self.deadline.set_budget(budget);
    }

    /// Budget left, or [`Error::Timeout`] once it is used up.
    pub fn remaining(&self) -> Result<Duration> {
        self.deadline.remaining()
    }

    /// Frame `payload` and send it.
    pub fn send_request(&mut self, payload: &[u8]) -> Result<()> {
        let frame = protocol::encode(payload);
        self.write_all(&frame)
    }

    /// Send `bytes` exactly as given, without a length prefix.
    ///
    /// For receivers that don't speak the framing; pair with
    /// [`ClientSession::read_available`].
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all(bytes)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.set_interest(Interest::WRITABLE)?;

        let mut written = 0;
        while written < data.len() {
            let remaining = self.remaining_budget()?;
            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

            match stream.write(&data[written..]) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    )));
                }
                Ok(n) => {
                    written += n;
                    trace!(peer = %self.peer, written, total = data.len(), "Write");
                    continue;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }

            self.wait(remaining, 1)?;
        }

        debug!(peer = %self.peer, bytes = data.len(), "Request sent");
        Ok(())
    }

    /// Wait for one framed reply and return its payload.
    ///
    /// The session is closed once the reply is in; one frame per connection.
    pub fn get_reply(&mut self) -> Result<Bytes> {
        if let Some(reply) = protocol::take_frame(&mut self.reply) {
            self.close();
            return Ok(reply);
        }

        self.set_interest(Interest::READABLE)?;

        loop {
            let eof = self.fill_reply()?;

            if let Some(reply) = protocol::take_frame(&mut self.reply) {
                debug!(peer = %self.peer, bytes = reply.len(), "Reply received");
                self.close();
                return Ok(reply);
            }

            if !self.malformed_logged && protocol::try_decode(&self.reply) == Decode::Malformed {
                self.malformed_logged = true;
                warn!(peer = %self.peer, "Malformed length prefix in reply, waiting for more data");
            }

            if eof {
                self.close();
                return Err(Error::PeerClosed);
            }

            let remaining = self.remaining_budget()?;
            self.wait(remaining, RECEIVE_WAIT_ATTEMPTS)?;
        }
    }

    /// Return whatever raw bytes arrive within `timeout`.
    ///
    /// Waits up to the remaining budget when `timeout` is `None`. Returns
    /// `None` if nothing arrived. No framing is applied.
    pub fn read_available(&mut self, timeout: Option<Duration>) -> Result<Option<Bytes>> {
        let timeout = match timeout {
            Some(timeout) => timeout,
            None => self.remaining_budget()?,
        };

        self.set_interest(Interest::READABLE)?;

        let eof = self.fill_reply()?;
        if self.reply.is_empty() && !eof {
            self.wait(timeout, 1)?;
            self.fill_reply()?;
        }

        if self.reply.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.reply.split().freeze()))
    }

    /// Close the connection.
    ///
    /// Returns `false` if it was already closed.
    pub fn close(&mut self) -> bool {
        match self.stream.take() {
            Some(mut stream) => {
                let _ = self.poll.registry().deregister(&mut stream);
                let _ = stream.shutdown(Shutdown::Both);
                debug!(peer = %self.peer, "Connection closed");
                true
            }
            None => false,
        }
    }

    /// Whether the session is closed.
    ///
    /// Detecting that the peer has closed closes this session too.
    pub fn is_closed(&mut self) -> bool {
        let stream = match &self.stream {
            Some(stream) => stream,
            None => return true,
        };

        let mut probe = [0u8; 1];
        let closed = match stream.peek(&mut probe) {
            Ok(0) => true,
            Ok(_) => false,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                false
            }
            Err(_) => true,
        };

        if closed {
            self.close();
        }
        closed
    }

    fn remaining_budget(&self) -> Result<Duration> {
        self.deadline.remaining().map_err(|e| {
            if let Some(Ok(Some(os_err))) = self.stream.as_ref().map(|s| s.take_error()) {
                if os_err.kind() == io::ErrorKind::TimedOut {
                    warn!(peer = %self.peer, error = %os_err, "Client socket timed out");
                }
            }
            debug!(
                peer = %self.peer,
                elapsed_ms = self.deadline.elapsed().as_millis() as u64,
                "Wait budget exhausted"
            );
            e
        })
    }

    fn set_interest(&mut self, interest: Interest) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        if self.interest != interest {
            self.poll
                .registry()
                .reregister(stream, CLIENT_TOKEN, interest)
                .map_err(Error::Io)?;
            self.interest = interest;
        }
        Ok(())
    }

    /// Bounded readiness wait, retried up to `attempts` times on failure.
    fn wait(&mut self, timeout: Duration, attempts: usize) -> Result<()> {
        let mut last_err = None;
        for _ in 0..attempts.max(1) {
            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    trace!(peer = %self.peer, error = %e, "Readiness wait failed");
                    last_err = Some(e);
                }
            }
        }
        Err(Error::Io(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "readiness wait failed")
        })))
    }

    /// Read everything available into the reply buffer.
    ///
    /// Returns whether end-of-stream was reached.
    fn fill_reply(&mut self) -> Result<bool> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.reply.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

/// Connect to the first reachable address for `host:port`.
fn connect(host: &str, port: u16, timeout: Duration) -> io::Result<std::net::TcpStream> {
    let mut last_err = None;

    for addr in (host, port).to_socket_addrs()? {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        match socket.connect_timeout(&addr.into(), timeout) {
            Ok(()) => return Ok(socket.into()),
            Err(e) => {
                debug!(addr = %addr, error = %e, "Connect attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no addresses resolved for {host}:{port}"),
        )
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::rc::Rc;
    use std::thread;
    use std::time::Instant;

    const CONNECT: Duration = Duration::from_secs(5);

    #[derive(Clone, Default)]
    struct ManualClock(Rc<Cell<Duration>>);

    impl Clock for ManualClock {
        fn elapsed(&self) -> Duration {
            self.0.get()
        }
    }

    fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn test_request_and_reply() {
        let (listener, port) = listener();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 7];
            stream.read_exact(&mut request).unwrap();
            stream.write_all(b"5\nworld").unwrap();
            request
        });

        let mut session = ClientSession::open("127.0.0.1", port, CONNECT).unwrap();
        assert_eq!(session.wait_budget(), DEFAULT_WAIT_BUDGET);
        assert_eq!(session.peer_addr().port(), port);

        session.send_request(b"hello").unwrap();
        assert_eq!(&session.get_reply().unwrap()[..], b"world");

        assert_eq!(&server.join().unwrap(), b"5\nhello");
        assert!(session.is_closed());
        assert!(!session.close());
    }

    #[test]
    fn test_reply_arrives_in_pieces() {
        let (listener, port) = listener();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 4];
            stream.read_exact(&mut request).unwrap();
            stream.write_all(b"1").unwrap();
            thread::sleep(Duration::from_millis(30));
            stream.write_all(b"1\nhello").unwrap();
            thread::sleep(Duration::from_millis(30));
            stream.write_all(b" world").unwrap();
        });

        let mut session = ClientSession::open("127.0.0.1", port, CONNECT).unwrap();
        session.send_request(b"go").unwrap();
        assert_eq!(&session.get_reply().unwrap()[..], b"hello world");
        server.join().unwrap();
    }

    #[test]
    fn test_send_raw_and_read_available() {
        let (listener, port) = listener();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 6];
            stream.read_exact(&mut request).unwrap();
            stream.write_all(b"PONG\r\n").unwrap();
            request
        });

        let mut session = ClientSession::open("127.0.0.1", port, CONNECT).unwrap();
        session.send_raw(b"PING\r\n").unwrap();

        let mut received = Vec::new();
        let start = Instant::now();
        while received.len() < 6 && start.elapsed() < Duration::from_secs(2) {
            if let Some(bytes) = session.read_available(Some(Duration::from_millis(500))).unwrap() {
                received.extend_from_slice(&bytes);
            }
        }

        assert_eq!(received, b"PONG\r\n");
        assert_eq!(&server.join().unwrap(), b"PING\r\n");
    }

    #[test]
    fn test_read_available_times_out_empty() {
        let (_listener, port) = listener();
        let mut session = ClientSession::open("127.0.0.1", port, CONNECT).unwrap();

        let got = session
            .read_available(Some(Duration::from_millis(50)))
            .unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_peer_closed_before_reply() {
        let (listener, port) = listener();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"10\nshort").unwrap();
        });

        let mut session = ClientSession::open("127.0.0.1", port, CONNECT).unwrap();
        server.join().unwrap();

        assert!(matches!(session.get_reply(), Err(Error::PeerClosed)));
        assert!(session.is_closed());
    }

    #[test]
    fn test_silent_peer_times_out() {
        // Never accepted; the backlog completes the handshake
        let (_listener, port) = listener();

        let mut session = ClientSession::open("127.0.0.1", port, CONNECT).unwrap();
        session.set_wait_budget(Duration::from_millis(1500));
        session.send_request(b"anyone there?").unwrap();

        let start = Instant::now();
        assert!(matches!(session.get_reply(), Err(Error::Timeout)));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_budget_is_shared_across_calls() {
        let (_listener, port) = listener();
        let clock = ManualClock::default();

        let mut session =
            ClientSession::open_with_clock("127.0.0.1", port, CONNECT, clock.clone()).unwrap();
        session.set_wait_budget(Duration::from_secs(10));
        session.send_request(b"first").unwrap();

        clock.0.set(Duration::from_secs(9) + Duration::from_millis(500));
        assert!(matches!(session.remaining(), Err(Error::Timeout)));
        assert!(matches!(session.send_request(b"second"), Err(Error::Timeout)));
        assert!(matches!(session.get_reply(), Err(Error::Timeout)));
    }

    #[test]
    fn test_operations_after_close() {
        let (_listener, port) = listener();
        let mut session = ClientSession::open("127.0.0.1", port, CONNECT).unwrap();

        assert!(!session.is_closed());
        assert!(session.close());
        assert!(!session.close());
        assert!(session.is_closed());

        assert!(matches!(session.send_request(b"x"), Err(Error::NotConnected)));
        assert!(matches!(session.get_reply(), Err(Error::NotConnected)));
    }

    #[test]
    fn test_is_closed_detects_peer_shutdown() {
        let (listener, port) = listener();
        let mut session = ClientSession::open("127.0.0.1", port, CONNECT).unwrap();

        let (stream, _) = listener.accept().unwrap();
        drop(stream);

        let start = Instant::now();
        while !session.is_closed() && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(session.is_closed());
        assert!(!session.close());
    }

    #[test]
    fn test_connect_failure() {
        let (listener, port) = listener();
        drop(listener);

        let result = ClientSession::open("127.0.0.1", port, Duration::from_secs(1));
        assert!(matches!(result, Err(Error::Connect(_))));
    }
}
