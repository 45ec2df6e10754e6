//! Echo handler.
//!
//! Sends every request payload straight back:
//!
//! ```text
//! Request:  5\nhello
//! Response: 5\nhello
//! ```
//!
//! Useful for throughput testing and for checking that partial reads and
//! writes reassemble payloads of any size intact.

use crate::runtime::{ConnectionHandle, Disposition, Handler};
use bytes::Bytes;
use tracing::debug;

/// Echoes requests and counts what it has seen.
#[derive(Debug, Default)]
pub struct EchoHandler {
    echoed: u64,
    notified: u64,
}

impl EchoHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests echoed back.
    pub fn echoed(&self) -> u64 {
        self.echoed
    }

    /// Fire-and-forget requests received.
    pub fn notified(&self) -> u64 {
        self.notified
    }
}

impl Handler for EchoHandler {
    fn notify(&mut self, request: Bytes) {
        self.notified += 1;
        debug!(bytes = request.len(), "Echo notification");
    }

    fn respond(&mut self, request: Bytes, conn: &mut ConnectionHandle<'_>) -> Disposition {
        self.echoed += 1;
        conn.set_response(&request);
        Disposition::Keep
    }
}
