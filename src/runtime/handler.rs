//! Application request handlers.
//!
//! The reactor calls exactly one of the two methods per request, chosen by
//! what the peer did after sending it:
//!
//! - the peer half-closed right after its request: [`Handler::notify`]
//!   (fire-and-forget, nothing is sent back)
//! - the peer is still waiting: [`Handler::respond`] with a handle for
//!   setting the response
//!
//! Handlers run on the reactor thread. A handler that blocks stalls every
//! other connection until it returns.

use crate::runtime::connection::Connection;
use bytes::Bytes;

/// What the reactor should do with a connection after `respond`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep the connection and send the response, if one was set.
    Keep,
    /// Drop the connection without sending anything.
    Reject,
}

/// Application callback invoked for every fully framed request.
pub trait Handler {
    /// Handle a request from a peer that is no longer listening.
    fn notify(&mut self, request: Bytes);

    /// Handle a request and optionally set a response through `conn`.
    ///
    /// Returning [`Disposition::Reject`] removes the connection; any response
    /// set on it is discarded.
    fn respond(&mut self, request: Bytes, conn: &mut ConnectionHandle<'_>) -> Disposition;
}

/// Borrowed view of a connection handed to [`Handler::respond`].
pub struct ConnectionHandle<'a> {
    conn: &'a mut Connection,
}

impl<'a> ConnectionHandle<'a> {
    pub(crate) fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Queue `payload` to be framed and written back to the peer.
    pub fn set_response(&mut self, payload: impl AsRef<[u8]>) {
        self.conn.set_response(payload.as_ref());
    }

    /// Peer identity of the connection.
    pub fn peer(&self) -> &str {
        self.conn.peer()
    }

    /// Whether a response has been set and not yet sent.
    pub fn has_response(&self) -> bool {
        self.conn.is_response_ready()
    }
}
