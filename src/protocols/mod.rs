//! Sample request handlers.
//!
//! - `echo`: sends each payload back unchanged
//! - `ping`: PING/PONG health checks, QUIT drops the connection

pub mod echo;
pub mod ping;

pub use echo::EchoHandler;
pub use ping::PingHandler;
