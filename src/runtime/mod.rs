//! Single-threaded server runtime.
//!
//! - `Reactor`: listener, poll and the live-connection table
//! - `Connection`: per-peer request/response state machine
//! - `Handler`: application callback invoked per request

mod connection;
mod event_loop;
mod handler;

pub use connection::{ConnState, Connection, ConnectionRegistry};
pub use event_loop::{Reactor, ReactorConfig};
pub use handler::{ConnectionHandle, Disposition, Handler};
