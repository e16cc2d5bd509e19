//! Tidal Core - Completion-Driven TCP Transport
//!
//! This crate provides the transport layer underneath a message protocol:
//! connections and listeners that bind, connect, accept, send and receive
//! without blocking the caller, fed by a pool of reusable transfer buffers.
//!
//! # Performance-First Design Patterns:
//! - Operations the kernel can finish immediately complete inline
//! - Paged buffer pool with lock-free slot free lists
//! - One-shot atomic stage flags instead of per-endpoint locks
//! - Lifecycle notifications through plain trait objects, no boxing of futures

pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod stats;

pub use config::{
    ConnectionOptions, ListenerOptions, PoolConfig, ProtectionLevel, TransportConfig,
};
pub use engine::{shared_pool, BufferPool, Lease, PoolStats};
pub use error::{Operation, TransportError};
pub use lifecycle::{ConnectionState, ListenerState};
pub use net::{
    AcceptedSocket, Connection, ConnectionEvent, ConnectionEvents, EventChannel, FaultInfo,
    Listener, ListenerEvent, ListenerEvents, Received, SendLease,
};
pub use stats::StatsSnapshot;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG`, defaulting to `info`. Calling it again, or after the
/// host application installed its own subscriber, is a no-op.
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        info!("Initializing Tidal transport v{}", env!("CARGO_PKG_VERSION"));
    }
    Ok(())
}
