//! Tidal - TCP Transport Echo Server
//!
//! Runs a loopback echo server on top of the transport engine:
//! - A listener accepts peers and wraps each in an inherited connection
//! - Every received chunk is queued and sent back in order
//! - Ctrl-C disposes the listener and reports buffer pool usage

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tidal_core::{
    init, AcceptedSocket, BufferPool, Connection, ConnectionEvents, ConnectionOptions, Listener,
    ListenerEvents, Received, TransportConfig, TransportError,
};
use tracing::{error, info, warn};

const DEFAULT_PORT: u16 = 7000;

fn print_help() {
    println!("tidal - completion-driven TCP transport v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  tidal [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  -c, --config <FILE>   Load transport configuration from a JSON file");
    println!("  -p, --port <PORT>     Loopback port to listen on (default {DEFAULT_PORT})");
    println!("  -h, --help            Print this help message");
    println!("  -v, --version         Print version information");
    println!();
    println!("DESCRIPTION:");
    println!("  Starts an echo server on 127.0.0.1. Every byte a peer sends is");
    println!("  written back to it. Set RUST_LOG to control log verbosity.");
}

/// Echoes received bytes, one send in flight at a time.
#[derive(Default)]
struct Echo {
    queue: Mutex<EchoQueue>,
}

#[derive(Default)]
struct EchoQueue {
    pending: VecDeque<Vec<u8>>,
    in_flight: bool,
}

impl Echo {
    fn flush(&self, conn: &Connection) {
        let chunk = {
            let mut queue = self.queue.lock();
            if queue.in_flight {
                return;
            }
            let Some(chunk) = queue.pending.pop_front() else {
                return;
            };
            queue.in_flight = true;
            chunk
        };
        if let Err(e) = conn.send(&chunk) {
            warn!(conn = conn.id(), error = %e, "Echo send rejected");
            conn.dispose();
        }
    }
}

impl ConnectionEvents for Echo {
    fn on_connected(&self, conn: &Connection) {
        info!(conn = conn.id(), peer = ?conn.remote_addr(), "Peer connected");
    }

    fn on_received(&self, conn: &Connection, data: &Received<'_>) {
        self.queue.lock().pending.push_back(data.bytes().to_vec());
        self.flush(conn);
    }

    fn on_send_completed(&self, conn: &Connection, _bytes: usize) {
        self.queue.lock().in_flight = false;
        self.flush(conn);
    }

    fn on_exception(&self, conn: &Connection, error: &TransportError) {
        warn!(conn = conn.id(), %error, "Peer connection fault");
    }

    fn on_disposed(&self, conn: &Connection) {
        let stats = conn.stats();
        info!(
            conn = conn.id(),
            received = stats.bytes_received,
            sent = stats.bytes_sent,
            "Peer disconnected"
        );
    }
}

struct Acceptor {
    options: ConnectionOptions,
    pool: BufferPool,
}

impl ListenerEvents for Acceptor {
    fn on_listening(&self, listener: &Listener) {
        info!(addr = ?listener.local_addr(), "Echo server listening");
    }

    fn on_socket_connected(&self, _listener: &Listener, socket: AcceptedSocket) {
        let started = Connection::inherit(
            socket,
            self.options.clone(),
            Arc::new(Echo::default()),
            self.pool.clone(),
        )
        .and_then(|conn| conn.initialize());
        if let Err(e) = started {
            warn!(error = %e, "Could not start accepted connection");
        }
    }

    fn on_exception(&self, _listener: &Listener, error: &TransportError) {
        error!(%error, "Listener fault");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config_path = None;
    let mut port = DEFAULT_PORT;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                println!("tidal {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "-c" | "--config" => {
                config_path = Some(args.next().context("--config requires a file path")?);
            }
            "-p" | "--port" => {
                let value = args.next().context("--port requires a value")?;
                port = value
                    .parse()
                    .with_context(|| format!("invalid port '{value}'"))?;
            }
            _ => {
                eprintln!("error: unrecognized argument '{}'", arg);
                eprintln!("Run 'tidal --help' for usage information.");
                std::process::exit(1);
            }
        }
    }

    init()?;

    let config = match config_path {
        Some(path) => TransportConfig::load(path)?,
        None => TransportConfig::default(),
    };
    let pool = BufferPool::new(config.pool.clone())?;
    let acceptor = Arc::new(Acceptor {
        options: config.connection.clone(),
        pool: pool.clone(),
    });

    let listener = Listener::new(config.listener.clone(), acceptor)?;
    listener.bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    listener.listen();
    if listener.is_disposed() {
        bail!("could not listen on 127.0.0.1:{port}");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    listener.dispose();
    info!(stats = ?pool.stats(), "Buffer pool at exit");

    Ok(())
}
