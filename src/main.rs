//! framewire: length-prefixed request/response over TCP
//!
//! Subcommands:
//! - `serve`: run a single-threaded reactor with a sample handler
//! - `request`: send one request and print the reply
//!
//! Configuration via CLI arguments or TOML file.

use framewire::config::{Config, HandlerKind, Mode};
use framewire::protocols::{EchoHandler, PingHandler};
use framewire::{ClientSession, Handler, Reactor};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Never set; the server runs until the process is killed.
static STOP: AtomicBool = AtomicBool::new(false);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match config.mode.clone() {
        Mode::Serve { handler } => {
            info!(
                listen = %config.listen,
                handler = ?handler,
                max_connections = config.max_connections,
                "Starting framewire server"
            );
            match handler {
                HandlerKind::Echo => serve(&config, EchoHandler::new()),
                HandlerKind::Ping => serve(&config, PingHandler),
            }
        }
        Mode::Request { payload, raw } => request(&config, payload.as_bytes(), raw),
    }
}

fn serve<H: Handler>(config: &Config, handler: H) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = config.listen.parse()?;
    let mut reactor = Reactor::bind(addr, config.reactor(), handler)?;
    reactor.run_until(&STOP);
    Ok(())
}

fn request(config: &Config, payload: &[u8], raw: bool) -> Result<(), Box<dyn std::error::Error>> {
    let (host, port) = config.connect_target()?;
    let mut session =
        ClientSession::open(&host, port, Duration::from_secs(config.connect_timeout))?;
    session.set_wait_budget(Duration::from_secs(config.wait_budget));

    let reply = if raw {
        session.send_raw(payload)?;
        session.read_available(None)?.unwrap_or_default()
    } else {
        session.send_request(payload)?;
        session.get_reply()?
    };

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&reply)?;
    stdout.write_all(b"\n")?;
    Ok(())
}
