//! Error types shared by the client session and the reactor.

use std::io;

/// Transport errors.
#[derive(Debug)]
pub enum Error {
    /// Connecting to a peer or binding the listener failed.
    Connect(io::Error),
    /// The wait budget ran out before the operation finished.
    Timeout,
    /// The readiness wait or a socket read/write failed.
    Io(io::Error),
    /// The session has already been closed.
    NotConnected,
    /// The peer closed the connection before a full frame arrived.
    PeerClosed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Connect(e) => write!(f, "connection failed: {e}"),
            Error::Timeout => write!(f, "timed out waiting for peer"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::NotConnected => write!(f, "connection is closed"),
            Error::PeerClosed => write!(f, "peer closed the connection"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connect(e) | Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias using the transport [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
