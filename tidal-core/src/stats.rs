//! Per-connection traffic counters.
//!
//! # Design Goals:
//! - Lock-free atomic counters, updated from whichever worker runs a completion
//! - Zero allocation in the receive/send hot paths
//! - Point-in-time [`StatsSnapshot`] for callers

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Traffic counters for one [`Connection`](crate::Connection).
#[derive(Debug, Default)]
pub struct ConnectionStats {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    receives: AtomicU64,
    sends: AtomicU64,
    // Milliseconds since the Unix epoch; 0 means "never".
    connected_at_ms: AtomicU64,
    authenticated_at_ms: AtomicU64,
    last_receive_ms: AtomicU64,
    last_send_ms: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_connected(&self) {
        self.connected_at_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn record_authenticated(&self) {
        self.authenticated_at_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn record_receive(&self, bytes: usize) {
        self.receives.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_receive_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn record_send(&self, bytes: usize) {
        self.sends.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_send_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Get a snapshot of current counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            receives: self.receives.load(Ordering::Relaxed),
            sends: self.sends.load(Ordering::Relaxed),
            connected_at: from_ms(self.connected_at_ms.load(Ordering::Relaxed)),
            authenticated_at: from_ms(self.authenticated_at_ms.load(Ordering::Relaxed)),
            last_receive: from_ms(self.last_receive_ms.load(Ordering::Relaxed)),
            last_send: from_ms(self.last_send_ms.load(Ordering::Relaxed)),
        }
    }
}

/// A point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Completed receive operations that delivered data.
    pub receives: u64,
    /// Completed send operations.
    pub sends: u64,
    pub connected_at: Option<SystemTime>,
    pub authenticated_at: Option<SystemTime>,
    pub last_receive: Option<SystemTime>,
    pub last_send: Option<SystemTime>,
}

impl StatsSnapshot {
    /// Time since the connection was established, if it was.
    pub fn uptime(&self) -> Option<Duration> {
        self.connected_at
            .and_then(|at| SystemTime::now().duration_since(at).ok())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
        .max(1)
}

fn from_ms(ms: u64) -> Option<SystemTime> {
    (ms != 0).then(|| UNIX_EPOCH + Duration::from_millis(ms))
}
