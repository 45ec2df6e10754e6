//! Connection state machine for accepted TCP connections.
//!
//! Each connection carries at most one request/response exchange:
//! `Reading -> AwaitingResponse -> Writing -> Closed`. There is no
//! keep-alive; the reactor removes the connection once the response drains.

use crate::protocol::{self, Decode};
use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use slab::Slab;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use tracing::{trace, warn};

/// Size of each socket read.
const READ_CHUNK: usize = 16 * 1024;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accumulating request bytes.
    Reading,
    /// Request handed to the handler, no response set yet.
    AwaitingResponse,
    /// Writing the encoded response.
    Writing {
        /// Bytes already written.
        written: usize,
        /// Total encoded bytes to write.
        total: usize,
    },
    /// Socket shut down, waiting for removal.
    Closed,
}

/// A single accepted peer.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: String,
    state: ConnState,
    read_buf: BytesMut,
    response: Bytes,
    /// End-of-stream seen on a read.
    eof: bool,
    /// Whether the socket is currently registered for writability.
    write_interest: bool,
    malformed_logged: bool,
}

impl Connection {
    /// Create a new connection in the initial reading state.
    pub fn new(stream: TcpStream, peer: String) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Reading,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            response: Bytes::new(),
            eof: false,
            write_interest: false,
            malformed_logged: false,
        }
    }

    /// Peer identity (the remote address).
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state != ConnState::Closed
    }

    /// Read everything currently available into the read buffer.
    ///
    /// A zero-byte read records end-of-stream and is not an error.
    pub fn append_incoming_bytes(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0;

        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        trace!(peer = %self.peer, bytes = total, buffered = self.read_buf.len(), "Read");
        Ok(total)
    }

    /// Whether a full frame is sitting in the read buffer.
    pub fn is_request_complete(&self) -> bool {
        matches!(protocol::try_decode(&self.read_buf), Decode::Complete { .. })
    }

    /// Whether the request has already been extracted and handed off.
    pub fn request_received(&self) -> bool {
        !matches!(self.state, ConnState::Reading)
    }

    /// Split the request frame off the read buffer.
    ///
    /// Returns `None` while the frame is incomplete or malformed. Bytes after
    /// the frame stay buffered.
    pub fn extract_request(&mut self) -> Option<Bytes> {
        if self.state != ConnState::Reading {
            return None;
        }

        match protocol::take_frame(&mut self.read_buf) {
            Some(request) => {
                self.state = ConnState::AwaitingResponse;
                Some(request)
            }
            None => {
                if !self.malformed_logged
                    && protocol::try_decode(&self.read_buf) == Decode::Malformed
                {
                    self.malformed_logged = true;
                    warn!(peer = %self.peer, "Malformed length prefix, waiting for more data");
                }
                None
            }
        }
    }

    /// Record the response payload to send back.
    pub fn set_response(&mut self, payload: &[u8]) {
        if !self.is_open() {
            return;
        }
        self.response = protocol::encode(payload);
        self.state = ConnState::Writing {
            written: 0,
            total: self.response.len(),
        };
    }

    /// A response is set and not yet fully written.
    pub fn is_response_ready(&self) -> bool {
        matches!(self.state, ConnState::Writing { written, total } if written < total)
    }

    /// The whole encoded response has been written.
    pub fn is_response_sent(&self) -> bool {
        matches!(self.state, ConnState::Writing { written, total } if written == total)
    }

    /// Write as much of the response as the socket accepts.
    ///
    /// Returns whether the response is now fully sent.
    pub fn drain_response(&mut self) -> io::Result<bool> {
        let (mut written, total) = match self.state {
            ConnState::Writing { written, total } => (written, total),
            _ => return Ok(false),
        };

        while written < total {
            match self.stream.write(&self.response[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        trace!(peer = %self.peer, written, total, "Write");
        self.state = ConnState::Writing { written, total };
        Ok(self.is_response_sent())
    }

    /// Whether the peer has shut down its sending side.
    ///
    /// Peeks without consuming buffered data. Does not close the local side.
    pub fn is_peer_closed(&mut self) -> bool {
        if self.eof {
            return true;
        }

        let mut probe = [0u8; 1];
        match self.stream.peek(&mut probe) {
            Ok(0) => {
                self.eof = true;
                true
            }
            Ok(_) => false,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                false
            }
            Err(_) => true,
        }
    }

    /// End-of-stream was seen while reading.
    pub fn eof_seen(&self) -> bool {
        self.eof
    }

    /// Shut the socket down. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        self.state = ConnState::Closed;
    }

    /// Register with the poll for readability.
    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.stream, token, Interest::READABLE)
    }

    /// Add or drop write interest to match `is_response_ready`.
    pub fn sync_interest(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let wants_write = self.is_response_ready();
        if wants_write == self.write_interest {
            return Ok(());
        }

        let interest = if wants_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        registry.reregister(&mut self.stream, token, interest)?;
        self.write_interest = wants_write;
        Ok(())
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }
}

/// Registry of live connections.
///
/// Slab keys double as poll tokens; a side index maps peer identity to key so
/// no two live connections share a peer identity.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    by_peer: HashMap<String, usize>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(4096)),
            by_peer: HashMap::new(),
            max_connections,
        }
    }

    /// Insert a new connection.
    ///
    /// Returns `None` at capacity or when the peer identity is already live.
    pub fn insert(&mut self, conn: Connection) -> Option<usize> {
        if self.connections.len() >= self.max_connections
            || self.by_peer.contains_key(conn.peer())
        {
            return None;
        }
        let peer = conn.peer().to_string();
        let id = self.connections.insert(conn);
        self.by_peer.insert(peer, id);
        Some(id)
    }

    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Look up a connection id by peer identity.
    pub fn find_by_peer(&self, peer: &str) -> Option<usize> {
        self.by_peer.get(peer).copied()
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        let conn = self.connections.try_remove(id)?;
        self.by_peer.remove(conn.peer());
        Some(conn)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Iterate over all connections mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Connection)> {
        self.connections.iter_mut()
    }
}
