//! framewire: a minimal length-prefixed TCP transport.
//!
//! Every message is `<decimal length>\n<payload>`. Two sides share the
//! framing:
//!
//! - [`ClientSession`]: connect, send one request, wait for one reply, all
//!   under a single deadline budget
//! - [`Reactor`]: a single-threaded readiness loop that accepts many peers,
//!   hands each complete request to a [`Handler`] and writes the response back
//!
//! Each connection carries exactly one request/response exchange.

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod protocol;
pub mod protocols;
pub mod runtime;

pub use client::ClientSession;
pub use clock::{Clock, Deadline, MonotonicClock};
pub use error::{Error, Result};
pub use runtime::{ConnectionHandle, Disposition, Handler, Reactor, ReactorConfig};
