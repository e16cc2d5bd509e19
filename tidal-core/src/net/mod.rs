//! Network module - the connection and listener engines
//!
//! Both engines share the same shape: one-shot stage flags, inline draining
//! of operations the kernel can complete immediately, tokio tasks for the
//! rest, and a single teardown path that always ends with `disposed`.

use std::sync::atomic::{AtomicU64, Ordering};

pub mod connection;
pub mod events;
pub mod listener;
pub(crate) mod socket;
#[cfg(test)]
pub(crate) mod testing;

pub use connection::{Connection, SendLease};
pub use events::{
    ConnectionEvent, ConnectionEvents, EventChannel, FaultInfo, ListenerEvent, ListenerEvents,
    Received,
};
pub use listener::{AcceptedSocket, Listener};

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id used to correlate an endpoint's log lines.
pub(crate) fn next_endpoint_id() -> u64 {
    NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed)
}
