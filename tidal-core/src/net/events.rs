//! Lifecycle notifications
//!
//! Connections and listeners report everything that happens to them through
//! an event sink. Sinks are plain traits with no-op defaults, so a consumer
//! overrides only what it cares about. Notifications run on whichever worker
//! completed the operation and must not block.
//!
//! [`EventChannel`] is a ready-made sink that forwards every notification as
//! an owned enum over a tokio channel, for consumers that prefer to `await`
//! events instead of handling them inline.

use std::io;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::engine::Lease;
use crate::error::{Operation, TransportError};
use crate::net::connection::Connection;
use crate::net::listener::{AcceptedSocket, Listener};

/// Bytes delivered by one completed receive.
///
/// Borrowed from the receive lease; the slot goes back to the pool as soon
/// as the notification returns.
pub struct Received<'a> {
    lease: &'a Lease,
    count: usize,
}

impl<'a> Received<'a> {
    pub(crate) fn new(lease: &'a Lease, count: usize) -> Self {
        Self { lease, count }
    }

    /// The received bytes.
    pub fn bytes(&self) -> &'a [u8] {
        &self.lease.as_slice()[..self.count]
    }

    /// Identity of the page buffer holding the bytes.
    pub fn buffer_id(&self) -> u64 {
        self.lease.buffer_id()
    }

    /// Offset of the first byte inside the page buffer.
    pub fn offset(&self) -> usize {
        self.lease.offset()
    }

    /// Returns the number of bytes received.
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Notifications raised by a [`Connection`].
#[allow(unused_variables)]
pub trait ConnectionEvents: Send + Sync + 'static {
    fn on_bound(&self, conn: &Connection) {}

    /// Raised once during teardown when bind was attempted but never completed.
    fn on_bind_failed(&self, conn: &Connection) {}

    fn on_connected(&self, conn: &Connection) {}

    /// Raised once during teardown when connect was attempted but never completed.
    fn on_connect_failed(&self, conn: &Connection) {}

    fn on_authenticated(&self, conn: &Connection) {}

    fn on_received(&self, conn: &Connection, data: &Received<'_>) {}

    fn on_send_completed(&self, conn: &Connection, bytes: usize) {}

    fn on_send_failed(&self, conn: &Connection, error: &TransportError) {}

    fn on_receive_failed(&self, conn: &Connection, error: &TransportError) {}

    fn on_exception(&self, conn: &Connection, error: &TransportError) {}

    /// Always the last notification a connection raises. When another
    /// notification is still running, this one waits for it to return.
    fn on_disposed(&self, conn: &Connection) {}
}

/// Notifications raised by a [`Listener`].
#[allow(unused_variables)]
pub trait ListenerEvents: Send + Sync + 'static {
    fn on_bound(&self, listener: &Listener) {}

    fn on_bind_failed(&self, listener: &Listener) {}

    fn on_listening(&self, listener: &Listener) {}

    fn on_listen_failed(&self, listener: &Listener) {}

    /// A peer connected. Dropping `socket` closes it.
    fn on_socket_connected(&self, listener: &Listener, socket: AcceptedSocket) {}

    fn on_exception(&self, listener: &Listener, error: &TransportError) {}

    /// Always the last notification a listener raises.
    fn on_disposed(&self, listener: &Listener) {}
}

impl ConnectionEvents for () {}
impl ListenerEvents for () {}

/// Owned summary of a [`TransportError`] carried by channel events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultInfo {
    pub operation: Option<Operation>,
    pub kind: Option<io::ErrorKind>,
    pub message: String,
}

impl From<&TransportError> for FaultInfo {
    fn from(error: &TransportError) -> Self {
        Self {
            operation: error.operation(),
            kind: error.io_kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Bound,
    BindFailed,
    Connected,
    ConnectFailed,
    Authenticated,
    Received(Vec<u8>),
    SendCompleted(usize),
    SendFailed(FaultInfo),
    ReceiveFailed(FaultInfo),
    Exception(FaultInfo),
    Disposed,
}

#[derive(Debug)]
pub enum ListenerEvent {
    Bound,
    BindFailed,
    Listening,
    ListenFailed,
    SocketConnected(AcceptedSocket),
    Exception(FaultInfo),
    Disposed,
}

/// Event sink that forwards notifications over an unbounded channel.
pub struct EventChannel<E> {
    tx: mpsc::UnboundedSender<E>,
}

impl<E: Send + 'static> EventChannel<E> {
    /// Returns the sink to hand to an endpoint and the receiving end of
    /// its channel.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn emit(&self, event: E) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl ConnectionEvents for EventChannel<ConnectionEvent> {
    fn on_bound(&self, _conn: &Connection) {
        self.emit(ConnectionEvent::Bound);
    }

    fn on_bind_failed(&self, _conn: &Connection) {
        self.emit(ConnectionEvent::BindFailed);
    }

    fn on_connected(&self, _conn: &Connection) {
        self.emit(ConnectionEvent::Connected);
    }

    fn on_connect_failed(&self, _conn: &Connection) {
        self.emit(ConnectionEvent::ConnectFailed);
    }

    fn on_authenticated(&self, _conn: &Connection) {
        self.emit(ConnectionEvent::Authenticated);
    }

    fn on_received(&self, _conn: &Connection, data: &Received<'_>) {
        self.emit(ConnectionEvent::Received(data.bytes().to_vec()));
    }

    fn on_send_completed(&self, _conn: &Connection, bytes: usize) {
        self.emit(ConnectionEvent::SendCompleted(bytes));
    }

    fn on_send_failed(&self, _conn: &Connection, error: &TransportError) {
        self.emit(ConnectionEvent::SendFailed(error.into()));
    }

    fn on_receive_failed(&self, _conn: &Connection, error: &TransportError) {
        self.emit(ConnectionEvent::ReceiveFailed(error.into()));
    }

    fn on_exception(&self, _conn: &Connection, error: &TransportError) {
        self.emit(ConnectionEvent::Exception(error.into()));
    }

    fn on_disposed(&self, _conn: &Connection) {
        self.emit(ConnectionEvent::Disposed);
    }
}

impl ListenerEvents for EventChannel<ListenerEvent> {
    fn on_bound(&self, _listener: &Listener) {
        self.emit(ListenerEvent::Bound);
    }

    fn on_bind_failed(&self, _listener: &Listener) {
        self.emit(ListenerEvent::BindFailed);
    }

    fn on_listening(&self, _listener: &Listener) {
        self.emit(ListenerEvent::Listening);
    }

    fn on_listen_failed(&self, _listener: &Listener) {
        self.emit(ListenerEvent::ListenFailed);
    }

    fn on_socket_connected(&self, _listener: &Listener, socket: AcceptedSocket) {
        self.emit(ListenerEvent::SocketConnected(socket));
    }

    fn on_exception(&self, _listener: &Listener, error: &TransportError) {
        self.emit(ListenerEvent::Exception(error.into()));
    }

    fn on_disposed(&self, _listener: &Listener) {
        self.emit(ListenerEvent::Disposed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::engine::BufferPool;

    #[test]
    fn test_received_view() {
        let pool = BufferPool::new(PoolConfig {
            items_per_page: 1,
            buffer_size: 16,
            sweep_interval: None,
            ..Default::default()
        })
        .unwrap();
        let mut lease = pool.rent();
        lease.as_mut_slice()[..3].copy_from_slice(b"abc");

        let view = Received::new(&lease, 3);
        assert_eq!(view.bytes(), b"abc");
        assert_eq!(view.count(), 3);
        assert_eq!(view.offset(), 0);
        assert_eq!(view.buffer_id(), lease.buffer_id());
    }

    #[test]
    fn test_fault_info_from_io_error() {
        let error = TransportError::io(
            Operation::Receive,
            io::Error::from(io::ErrorKind::ConnectionReset),
        );
        let info = FaultInfo::from(&error);
        assert_eq!(info.operation, Some(Operation::Receive));
        assert_eq!(info.kind, Some(io::ErrorKind::ConnectionReset));
        assert!(info.message.contains("receive"));

        let info = FaultInfo::from(&TransportError::Disposed);
        assert_eq!(info.operation, None);
        assert_eq!(info.kind, None);
    }

    #[test]
    fn test_channel_survives_dropped_receiver() {
        let (sink, rx) = EventChannel::<ConnectionEvent>::new();
        drop(rx);
        sink.emit(ConnectionEvent::Disposed);
    }
}
