//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS.
//!
//! Everything runs on the calling thread. One [`Reactor::tick`] is an accept
//! phase followed by a single multiplexed wait over all live connections,
//! then a read pass and a write pass over whatever became ready.

use crate::error::{Error, Result};
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::handler::{ConnectionHandle, Disposition, Handler};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

const LISTEN_BACKLOG: i32 = 1024;
const EVENTS_CAPACITY: usize = 1024;

/// Reactor tuning knobs.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// How long the accept phase waits when no connection is live.
    pub accept_timeout: Duration,
    /// Upper bound on the multiplexed wait in each tick.
    pub poll_timeout: Duration,
    /// Peers accepted beyond this are dropped.
    pub max_connections: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            accept_timeout: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(5),
            max_connections: 1024,
        }
    }
}

/// Readiness reported for one connection in a tick.
#[derive(Debug, Clone, Copy)]
struct Ready {
    conn_id: usize,
    readable: bool,
    writable: bool,
}

/// Single-threaded server: listener, live connections and the handler.
pub struct Reactor<H> {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: ConnectionRegistry,
    handler: H,
    config: ReactorConfig,
}

impl<H: Handler> Reactor<H> {
    /// Bind the listening socket and set up the poll.
    pub fn bind(addr: SocketAddr, config: ReactorConfig, handler: H) -> Result<Self> {
        let listener = create_listener(addr).map_err(Error::Connect)?;
        let mut listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr().map_err(Error::Connect)?;

        let poll = Poll::new().map_err(Error::Io)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(Error::Io)?;

        info!(
            addr = %local_addr,
            max_connections = config.max_connections,
            accept_timeout_ms = config.accept_timeout.as_millis() as u64,
            poll_timeout_ms = config.poll_timeout.as_millis() as u64,
            "Listening"
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            local_addr,
            connections: ConnectionRegistry::new(config.max_connections),
            handler,
            config,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Tick until `stop` is set.
    ///
    /// Failed ticks are logged and the loop carries on.
    pub fn run_until(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            if let Err(e) = self.tick() {
                error!(error = %e, "Reactor tick failed");
            }
        }
        debug!(addr = %self.local_addr, "Reactor stopped");
    }

    /// Run one accept phase and one multiplex pass.
    ///
    /// Only a failed readiness wait is returned as an error; problems on a
    /// single connection remove that connection and nothing else.
    pub fn tick(&mut self) -> Result<()> {
        self.check_listener_error();
        self.accept_phase()?;
        self.multiplex_phase()
    }

    fn check_listener_error(&self) {
        if let Ok(Some(e)) = self.listener.take_error() {
            if e.kind() == io::ErrorKind::TimedOut {
                warn!(addr = %self.local_addr, error = %e, "Listening socket timed out");
            } else {
                debug!(addr = %self.local_addr, error = %e, "Listening socket error");
            }
        }
    }

    /// Accept at most one new peer.
    ///
    /// Waits for one only while there is nothing else to service.
    fn accept_phase(&mut self) -> Result<()> {
        if self.accept_one() || !self.connections.is_empty() {
            return Ok(());
        }

        self.wait(self.config.accept_timeout)?;
        self.accept_one();
        Ok(())
    }

    /// Non-blocking accept. Returns whether a peer was taken off the backlog.
    fn accept_one(&mut self) -> bool {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                self.register(stream, peer_addr);
                true
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => {
                error!(error = %e, "Accept error");
                false
            }
        }
    }

    fn register(&mut self, stream: mio::net::TcpStream, peer_addr: SocketAddr) {
        if self.connections.len() >= self.connections.capacity() {
            warn!(peer = %peer_addr, "Connection limit reached");
            return;
        }

        let peer = peer_addr.to_string();
        let conn_id = match self.connections.insert(Connection::new(stream, peer)) {
            Some(id) => id,
            None => {
                warn!(peer = %peer_addr, "Peer identity already live, dropping");
                return;
            }
        };

        let registered = match self.connections.get_mut(conn_id) {
            Some(conn) => conn.register(self.poll.registry(), Token(conn_id)),
            None => return,
        };
        if let Err(e) = registered {
            debug!(conn_id, error = %e, "Failed to register connection");
            self.close_connection(conn_id);
            return;
        }

        debug!(conn_id, peer = %peer_addr, "Accepted connection");
    }

    fn multiplex_phase(&mut self) -> Result<()> {
        if self.connections.is_empty() {
            return Ok(());
        }

        // Write interest follows whichever connections have a response queued
        let mut failed = Vec::new();
        for (conn_id, conn) in self.connections.iter_mut() {
            if let Err(e) = conn.sync_interest(self.poll.registry(), Token(conn_id)) {
                debug!(conn_id, error = %e, "Failed to update interest");
                failed.push(conn_id);
            }
        }
        for conn_id in failed {
            self.close_connection(conn_id);
        }

        self.wait(self.config.poll_timeout)?;

        let ready: Vec<Ready> = self
            .events
            .iter()
            .filter(|event| event.token() != LISTENER_TOKEN)
            .map(|event| Ready {
                conn_id: event.token().0,
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
            })
            .collect();

        trace!(ready = ready.len(), live = self.connections.len(), "Poll returned");

        for r in ready.iter().filter(|r| r.readable) {
            self.handle_readable(r.conn_id);
        }
        for r in ready.iter().filter(|r| r.writable) {
            self.handle_writable(r.conn_id);
        }

        Ok(())
    }

    /// One bounded readiness wait. An interrupted wait counts as no events.
    fn wait(&mut self, timeout: Duration) -> Result<()> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                self.events.clear();
                Ok(())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn handle_readable(&mut self, conn_id: usize) {
        let conn = match self.connections.get_mut(conn_id) {
            Some(conn) => conn,
            None => return,
        };

        if !conn.is_open() {
            return;
        }

        if conn.request_received() {
            // Still waiting on the handler's response; only watch for hangups
            if conn.is_peer_closed() {
                debug!(conn_id, "Peer closed while awaiting response");
                self.close_connection(conn_id);
            }
            return;
        }

        if let Err(e) = conn.append_incoming_bytes() {
            debug!(conn_id, error = %e, "Read error");
            self.close_connection(conn_id);
            return;
        }

        let request = match conn.extract_request() {
            Some(request) => request,
            None => {
                if conn.eof_seen() {
                    debug!(conn_id, "Peer closed before completing a request");
                    self.close_connection(conn_id);
                }
                return;
            }
        };

        trace!(conn_id, bytes = request.len(), "Request received");

        if conn.is_peer_closed() {
            // Fire-and-forget: nobody is left to read a response
            self.handler.notify(request);
            self.close_connection(conn_id);
            return;
        }

        let disposition = self
            .handler
            .respond(request, &mut ConnectionHandle::new(conn));
        if disposition == Disposition::Reject {
            debug!(conn_id, "Handler rejected request");
            self.close_connection(conn_id);
        }
    }

    fn handle_writable(&mut self, conn_id: usize) {
        let conn = match self.connections.get_mut(conn_id) {
            Some(conn) => conn,
            None => return,
        };

        match conn.drain_response() {
            Ok(true) => {
                debug!(conn_id, "Response sent");
                self.close_connection(conn_id);
            }
            Ok(false) => {}
            Err(e) => {
                debug!(conn_id, error = %e, "Write error");
                self.close_connection(conn_id);
            }
        }
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            let _ = conn.deregister(self.poll.registry());
            conn.close();
            debug!(conn_id, peer = %conn.peer(), "Connection closed");
        }
    }
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
