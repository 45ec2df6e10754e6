//! Ping handler.
//!
//! A minimal health-check protocol carried in framed payloads:
//!
//! ```text
//! Request:  PING         Response: PONG
//! Request:  PING hello   Response: PONG hello
//! Request:  QUIT         (connection dropped, no response)
//! ```
//!
//! Anything else gets `ERROR unknown command`.

use crate::runtime::{ConnectionHandle, Disposition, Handler};
use bytes::Bytes;
use tracing::debug;

/// Parsed ping command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Simple ping (no message).
    Ping,
    /// Ping with a message to echo back.
    PingMsg(Vec<u8>),
    /// Drop the connection.
    Quit,
    Unknown,
}

/// Parse a ping command from a request payload (case-insensitive verb).
pub fn parse(payload: &[u8]) -> Command {
    if payload.eq_ignore_ascii_case(b"PING") {
        Command::Ping
    } else if payload.eq_ignore_ascii_case(b"QUIT") {
        Command::Quit
    } else if payload.len() > 5 && payload[..5].eq_ignore_ascii_case(b"PING ") {
        Command::PingMsg(payload[5..].to_vec())
    } else {
        Command::Unknown
    }
}

/// Format a PONG response, with the ping message if there was one.
pub fn response_pong(msg: Option<&[u8]>) -> Vec<u8> {
    match msg {
        Some(msg) => {
            let mut out = Vec::with_capacity(5 + msg.len());
            out.extend_from_slice(b"PONG ");
            out.extend_from_slice(msg);
            out
        }
        None => b"PONG".to_vec(),
    }
}

/// Format an error response.
pub fn response_error() -> &'static [u8] {
    b"ERROR unknown command"
}

/// Answers pings; rejects the connection on `QUIT`.
#[derive(Debug, Default)]
pub struct PingHandler;

impl Handler for PingHandler {
    fn notify(&mut self, request: Bytes) {
        debug!(command = ?parse(&request), "Ping notification ignored");
    }

    fn respond(&mut self, request: Bytes, conn: &mut ConnectionHandle<'_>) -> Disposition {
        match parse(&request) {
            Command::Ping => conn.set_response(response_pong(None)),
            Command::PingMsg(msg) => conn.set_response(response_pong(Some(&msg))),
            Command::Quit => return Disposition::Reject,
            Command::Unknown => conn.set_response(response_error()),
        }
        Disposition::Keep
    }
}
