//! Connection Engine
//!
//! A [`Connection`] drives one TCP socket through
//! `Created → Bound → Connecting → Connected → Disposed`. Every stage runs at
//! most once no matter how many threads ask for it, and every failure funnels
//! into a single teardown that reports what went wrong and then reports
//! `disposed`, always last.
//!
//! # Performance-First Design:
//! - Receives and sends complete inline when the socket is ready; a tokio
//!   task is spawned only when the kernel has nothing to give yet
//! - The receive loop drains ready data iteratively, never recursively
//! - Transfer memory comes from the [`BufferPool`]; a receive slot is held
//!   only while data is actually being read
//!
//! Connections created by [`Connection::new`] bind and connect themselves.
//! Connections created by [`Connection::inherit`] wrap a socket accepted by a
//! [`Listener`](crate::Listener) and only need [`initialize`](Connection::initialize).

use std::any::Any;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use socket2::{SockAddr, SockRef, Socket};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionOptions;
use crate::engine::{BufferPool, Lease};
use crate::error::{Operation, Result, TransportError};
use crate::lifecycle::{stage_failure, ConnectionState, NotifyGate, StageFailure, StageFlag};
use crate::net::events::{ConnectionEvents, Received};
use crate::net::listener::AcceptedSocket;
use crate::net::next_endpoint_id;
use crate::net::socket::{self, SocketSettings};
use crate::stats::{ConnectionStats, StatsSnapshot};

/// A TCP connection endpoint. Cloning yields another handle to the same
/// connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    options: ConnectionOptions,
    events: Arc<dyn ConnectionEvents>,
    pool: BufferPool,
    runtime: Handle,
    inherited: bool,
    parent_addr: Option<SocketAddr>,

    bind_attempted: StageFlag,
    bound: StageFlag,
    connect_attempted: StageFlag,
    connected: StageFlag,
    dispose_attempted: StageFlag,
    disposed: StageFlag,
    initialized: StageFlag,
    authenticated: StageFlag,
    send_outstanding: AtomicBool,
    shutdown: CancellationToken,
    gate: NotifyGate,

    // Bound but not yet connecting.
    socket: Mutex<Option<Socket>>,
    stream: RwLock<Option<Arc<TcpStream>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    remote_addr: Mutex<Option<SocketAddr>>,
    user_token: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    stats: ConnectionStats,
}

impl Connection {
    /// Create a self-initiated connection.
    ///
    /// Must be called from within a tokio runtime; completions run on it.
    pub fn new(
        options: ConnectionOptions,
        events: Arc<dyn ConnectionEvents>,
        pool: BufferPool,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        Ok(Self::from_parts(options, events, pool, runtime, None))
    }

    /// Wrap a socket accepted by a listener.
    ///
    /// The connection starts out bound; call [`initialize`](Self::initialize)
    /// to raise `connected` and start receiving.
    pub fn inherit(
        accepted: AcceptedSocket,
        options: ConnectionOptions,
        events: Arc<dyn ConnectionEvents>,
        pool: BufferPool,
    ) -> Result<Self> {
        let local = accepted
            .stream
            .local_addr()
            .map_err(|e| TransportError::io(Operation::Accept, e))?;
        let conn = Self::from_parts(
            options,
            events,
            pool,
            accepted.runtime,
            Some(accepted.listener_addr),
        );
        *conn.inner.local_addr.lock() = Some(local);
        *conn.inner.remote_addr.lock() = Some(accepted.peer_addr);
        *conn.inner.stream.write() = Some(Arc::new(accepted.stream));
        conn.inner.bound.set();
        Ok(conn)
    }

    fn from_parts(
        options: ConnectionOptions,
        events: Arc<dyn ConnectionEvents>,
        pool: BufferPool,
        runtime: Handle,
        parent_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: next_endpoint_id(),
                options,
                events,
                pool,
                runtime,
                inherited: parent_addr.is_some(),
                parent_addr,
                bind_attempted: StageFlag::new(),
                bound: StageFlag::new(),
                connect_attempted: StageFlag::new(),
                connected: StageFlag::new(),
                dispose_attempted: StageFlag::new(),
                disposed: StageFlag::new(),
                initialized: StageFlag::new(),
                authenticated: StageFlag::new(),
                send_outstanding: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                gate: NotifyGate::new(),
                socket: Mutex::new(None),
                stream: RwLock::new(None),
                local_addr: Mutex::new(None),
                remote_addr: Mutex::new(None),
                user_token: Mutex::new(None),
                stats: ConnectionStats::new(),
            }),
        }
    }

    // ---- Accessors ------------------------------------------------------

    /// Returns the process-unique id used in this connection's log lines.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Returns the pool this connection leases its buffers from.
    pub fn pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    /// Returns the furthest lifecycle stage reached.
    pub fn state(&self) -> ConnectionState {
        let inner = &self.inner;
        if inner.disposed.is_set() {
            ConnectionState::Disposed
        } else if inner.connected.is_set() {
            ConnectionState::Connected
        } else if inner.connect_attempted.is_set() {
            ConnectionState::Connecting
        } else if inner.bound.is_set() {
            ConnectionState::Bound
        } else {
            ConnectionState::Created
        }
    }

    pub fn is_bound(&self) -> bool {
        self.inner.bound.is_set()
    }

    /// Returns `true` while connected and not yet disposed.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.is_set() && !self.is_disposed()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.is_set()
    }

    /// Whether this connection wraps a socket accepted by a listener.
    pub fn is_inherited(&self) -> bool {
        self.inner.inherited
    }

    /// The accepting side of a connection is its authority.
    pub fn is_authority(&self) -> bool {
        self.inner.inherited
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.is_set()
    }

    /// Returns the local address, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Returns the peer address, once connected.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.inner.remote_addr.lock()
    }

    /// Address of the listener that accepted this connection.
    pub fn parent_addr(&self) -> Option<SocketAddr> {
        self.inner.parent_addr
    }

    /// Returns a point-in-time copy of the transfer counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Returns the token last stored with [`set_user_token`](Self::set_user_token).
    pub fn user_token(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.user_token.lock().clone()
    }

    /// Attach an arbitrary value to this connection, replacing any previous one.
    pub fn set_user_token<T: Any + Send + Sync>(&self, token: T) {
        *self.inner.user_token.lock() = Some(Arc::new(token));
    }

    fn stream(&self) -> Option<Arc<TcpStream>> {
        self.inner.stream.read().clone()
    }

    /// Raise a notification unless teardown has started.
    fn notify(&self, notify: impl FnOnce(&dyn ConnectionEvents)) -> bool {
        let events = &*self.inner.events;
        self.inner
            .gate
            .run(|| notify(events), || self.notify_disposed())
    }

    fn notify_disposed(&self) {
        info!(conn = self.inner.id, "Connection disposed");
        self.inner.events.on_disposed(self);
    }

    fn reject_inherited(&self, op: &'static str) -> Result<()> {
        if self.inner.inherited {
            Err(TransportError::Inherited(op))
        } else {
            Ok(())
        }
    }

    // ---- Bind -----------------------------------------------------------

    /// Bind to an ephemeral IPv4 loopback port.
    pub fn bind(&self) -> Result<()> {
        self.bind_to(socket::loopback(0))
    }

    /// Bind to `port` on IPv4 loopback.
    pub fn bind_port(&self, port: u16) -> Result<()> {
        self.bind_to(socket::loopback(port))
    }

    /// Bind to `ip:port`.
    pub fn bind_addr(&self, ip: IpAddr, port: u16) -> Result<()> {
        self.bind_to(SocketAddr::new(ip, port))
    }

    /// Create the socket and bind it to `local`.
    ///
    /// Only the first call on a connection does anything. OS failures do not
    /// come back here; they dispose the connection and surface through its
    /// events.
    pub fn bind_to(&self, local: SocketAddr) -> Result<()> {
        self.reject_inherited("bind")?;

        // The slot stays locked until the socket is in it, so a concurrent
        // connect never finds it empty mid-bind.
        let outcome = {
            let mut slot = self.inner.socket.lock();
            if self.is_disposed() || !self.inner.bind_attempted.try_claim() {
                return Ok(());
            }
            let settings = SocketSettings::from(&self.inner.options);
            socket::bind_stream_socket(local, &settings).map(|(socket, addr)| {
                *slot = Some(socket);
                *self.inner.local_addr.lock() = Some(addr);
                self.inner.bound.set();
                addr
            })
        };

        match outcome {
            Ok(addr) => {
                debug!(conn = self.inner.id, local = %addr, "Connection bound");
                self.notify(|events| events.on_bound(self));
            }
            Err(e) => self.fault(TransportError::io(Operation::Bind, e)),
        }
        Ok(())
    }

    // ---- Connect --------------------------------------------------------

    /// Connect to `remote`, binding first if that has not happened yet.
    ///
    /// Returns once the attempt is issued; `on_connected` or the failure
    /// notifications follow.
    pub fn connect(&self, remote: SocketAddr) -> Result<()> {
        self.reject_inherited("connect")?;
        if self.is_disposed() || !self.inner.connect_attempted.try_claim() {
            return Ok(());
        }

        self.bind_to(socket::implicit_bind_addr(&remote))?;
        let Some(socket) = self.inner.socket.lock().take() else {
            // Bind failed or the connection was disposed meanwhile.
            return Ok(());
        };

        let _enter = self.inner.runtime.enter();
        debug!(conn = self.inner.id, %remote, "Connecting");
        let (stream, pending) = match start_connect(socket, remote) {
            Ok(started) => started,
            Err(e) => {
                self.fault(TransportError::io(Operation::Connect, e));
                return Ok(());
            }
        };

        let stream = Arc::new(stream);
        if !self.install_stream(stream.clone()) {
            return Ok(());
        }
        if pending {
            self.await_connect(stream);
        } else {
            self.establish();
        }
        Ok(())
    }

    /// Connect to `ip:port`. See [`connect`](Self::connect).
    pub fn connect_addr(&self, ip: IpAddr, port: u16) -> Result<()> {
        self.connect(SocketAddr::new(ip, port))
    }

    fn install_stream(&self, stream: Arc<TcpStream>) -> bool {
        let mut slot = self.inner.stream.write();
        if self.is_disposed() {
            return false;
        }
        *slot = Some(stream);
        true
    }

    fn await_connect(&self, stream: Arc<TcpStream>) {
        let this = self.clone();
        self.inner.runtime.spawn(async move {
            let ready = tokio::select! {
                _ = this.inner.shutdown.cancelled() => return,
                ready = wait_connected(&stream, this.inner.options.connection_timeout_secs) => ready,
            };
            match ready {
                Ok(()) => this.establish(),
                Err(error) => this.fault(error),
            }
        });
    }

    /// Start a connection built from an accepted socket.
    pub fn initialize(&self) -> Result<()> {
        if !self.inner.inherited {
            return Err(TransportError::NotInherited);
        }
        if self.is_disposed() || !self.inner.initialized.try_claim() {
            return Ok(());
        }
        let _enter = self.inner.runtime.enter();
        self.establish();
        Ok(())
    }

    /// Post-connect steps shared by both connection roles.
    fn establish(&self) {
        let Some(stream) = self.stream() else {
            return;
        };
        let addrs = stream
            .local_addr()
            .and_then(|local| stream.peer_addr().map(|remote| (local, remote)));
        let (local, remote) = match addrs {
            Ok(addrs) => addrs,
            Err(e) => {
                self.fault(TransportError::io(Operation::Connect, e));
                return;
            }
        };

        {
            // Teardown sets `disposed` before taking this lock, so a
            // connection is never marked connected once it is going away.
            let slot = self.inner.stream.write();
            if slot.is_none() || self.is_disposed() {
                return;
            }
            *self.inner.local_addr.lock() = Some(local);
            *self.inner.remote_addr.lock() = Some(remote);
            self.inner.connected.set();
        }
        self.inner.stats.record_connected();
        info!(
            conn = self.inner.id,
            %local,
            %remote,
            inherited = self.inner.inherited,
            "Connection established"
        );

        if !self.notify(|events| events.on_connected(self)) || self.is_disposed() {
            return;
        }
        self.receive_loop(stream);
    }

    // ---- Receive --------------------------------------------------------

    fn receive_loop(&self, stream: Arc<TcpStream>) {
        loop {
            if self.is_disposed() {
                return;
            }
            let mut lease = self.inner.pool.rent();
            match stream.try_read(lease.as_mut_slice()) {
                Ok(count) => {
                    if !self.deliver(lease, count) {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Nothing pending: hand the slot back while we wait.
                    drop(lease);
                    self.await_readable(stream);
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    drop(lease);
                    self.receive_failed(e);
                    return;
                }
            }
        }
    }

    fn await_readable(&self, stream: Arc<TcpStream>) {
        let this = self.clone();
        self.inner.runtime.spawn(async move {
            let ready = tokio::select! {
                _ = this.inner.shutdown.cancelled() => return,
                ready = stream.readable() => ready,
            };
            match ready {
                Ok(()) => this.receive_loop(stream),
                Err(e) => this.receive_failed(e),
            }
        });
    }

    /// Hand received bytes to the consumer. Returns whether to keep reading.
    fn deliver(&self, lease: Lease, count: usize) -> bool {
        if self.is_disposed() {
            return false;
        }
        if count == 0 {
            debug!(conn = self.inner.id, "Peer closed the connection");
            self.dispose();
            return false;
        }
        self.inner.stats.record_receive(count);
        let delivered =
            self.notify(|events| events.on_received(self, &Received::new(&lease, count)));
        drop(lease);
        delivered && !self.is_disposed()
    }

    fn receive_failed(&self, source: io::Error) {
        if self.is_disposed() {
            return;
        }
        let error = TransportError::io(Operation::Receive, source);
        self.notify(|events| events.on_receive_failed(self, &error));
        self.fault(error);
    }

    // ---- Send -----------------------------------------------------------

    fn check_sendable(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.disposed.is_set() {
            Err(TransportError::Disposed)
        } else if !inner.connected.is_set() {
            Err(TransportError::NotConnected)
        } else if inner.options.require_authentication && !inner.authenticated.is_set() {
            Err(TransportError::NotAuthenticated)
        } else {
            Ok(())
        }
    }

    /// Claim the connection's send slot and a buffer to fill.
    ///
    /// One send may be outstanding at a time: a second call before the first
    /// lease completes (or is dropped unsubmitted) gets `SendInProgress`.
    pub fn begin_send(&self) -> Result<SendLease> {
        self.check_sendable()?;
        if self
            .inner
            .send_outstanding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransportError::SendInProgress);
        }
        let permit = SendPermit {
            inner: self.inner.clone(),
        };
        Ok(SendLease {
            lease: self.inner.pool.rent(),
            permit,
        })
    }

    /// Send the first `bytes` bytes of `send`.
    ///
    /// The outcome arrives as `on_send_completed` or `on_send_failed`.
    pub fn end_send(&self, send: SendLease, bytes: usize) -> Result<()> {
        if !Arc::ptr_eq(&send.permit.inner, &self.inner) {
            return Err(TransportError::ForeignSendLease);
        }
        let SendLease { mut lease, permit } = send;
        if bytes > lease.capacity() {
            return Err(TransportError::PayloadTooLarge {
                len: bytes,
                capacity: lease.capacity(),
            });
        }
        let Some(stream) = self.stream().filter(|_| !self.is_disposed()) else {
            return Err(TransportError::Disposed);
        };
        lease.narrow(bytes);
        self.send_loop(stream, lease, permit, bytes);
        Ok(())
    }

    /// Copy `data` into a send lease and submit it.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let capacity = self.inner.pool.config().buffer_size;
        if data.len() > capacity {
            return Err(TransportError::PayloadTooLarge {
                len: data.len(),
                capacity,
            });
        }
        let mut lease = self.begin_send()?;
        lease.as_mut_slice()[..data.len()].copy_from_slice(data);
        self.end_send(lease, data.len())
    }

    fn send_loop(&self, stream: Arc<TcpStream>, mut lease: Lease, permit: SendPermit, total: usize) {
        loop {
            if self.is_disposed() {
                return;
            }
            if lease.is_empty() {
                drop(lease);
                drop(permit);
                self.send_completed(total);
                return;
            }
            match stream.try_write(lease.as_slice()) {
                Ok(0) => {
                    drop(lease);
                    drop(permit);
                    self.send_failed(io::ErrorKind::WriteZero.into());
                    return;
                }
                Ok(n) => lease.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.await_writable(stream, lease, permit, total);
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    drop(lease);
                    drop(permit);
                    self.send_failed(e);
                    return;
                }
            }
        }
    }

    fn await_writable(&self, stream: Arc<TcpStream>, lease: Lease, permit: SendPermit, total: usize) {
        let this = self.clone();
        self.inner.runtime.spawn(async move {
            let ready = tokio::select! {
                _ = this.inner.shutdown.cancelled() => return,
                ready = stream.writable() => ready,
            };
            match ready {
                Ok(()) => this.send_loop(stream, lease, permit, total),
                Err(e) => {
                    drop(lease);
                    drop(permit);
                    this.send_failed(e);
                }
            }
        });
    }

    fn send_completed(&self, bytes: usize) {
        self.inner.stats.record_send(bytes);
        self.notify(|events| events.on_send_completed(self, bytes));
    }

    fn send_failed(&self, source: io::Error) {
        if self.is_disposed() {
            return;
        }
        let error = TransportError::io(Operation::Send, source);
        self.notify(|events| events.on_send_failed(self, &error));
        self.fault(error);
    }

    // ---- Authentication -------------------------------------------------

    /// Record that the protocol layer has authenticated the peer.
    pub fn mark_authenticated(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(TransportError::Disposed);
        }
        if !self.inner.connected.is_set() {
            return Err(TransportError::NotConnected);
        }
        if self.inner.authenticated.try_claim() {
            self.inner.stats.record_authenticated();
            debug!(conn = self.inner.id, "Connection authenticated");
            self.notify(|events| events.on_authenticated(self));
        }
        Ok(())
    }

    // ---- Teardown -------------------------------------------------------

    /// Close the connection. Safe to call any number of times, from any thread,
    /// including from inside a notification; `on_disposed` then follows once
    /// that notification returns.
    pub fn dispose(&self) {
        if self.inner.dispose_attempted.try_claim() {
            self.teardown(None);
        }
    }

    fn fault(&self, error: TransportError) {
        if self.inner.dispose_attempted.try_claim() {
            warn!(conn = self.inner.id, %error, "Connection fault");
            self.teardown(Some(error));
        } else {
            debug!(conn = self.inner.id, %error, "Fault after dispose ignored");
        }
    }

    fn teardown(&self, error: Option<TransportError>) {
        let inner = &self.inner;
        inner.disposed.set();
        inner.gate.close();
        inner.shutdown.cancel();

        drop(inner.socket.lock().take());
        if let Some(stream) = inner.stream.write().take() {
            // The descriptor closes once in-flight tasks let go of it.
            let _ = SockRef::from(&*stream).shutdown(std::net::Shutdown::Both);
        }

        if let Some(error) = &error {
            inner.events.on_exception(self, error);
        }
        match stage_failure(
            &inner.bind_attempted,
            &inner.bound,
            &inner.connect_attempted,
            &inner.connected,
        ) {
            StageFailure::Bind => inner.events.on_bind_failed(self),
            StageFailure::Second => inner.events.on_connect_failed(self),
            StageFailure::None => {}
        }

        // Deferred while another notification is still running.
        inner.gate.finish(|| self.notify_disposed());
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("inherited", &self.inner.inherited)
            .field("local_addr", &self.local_addr())
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}

/// Issue a non-blocking connect. The flag is true when completion is deferred.
fn start_connect(socket: Socket, remote: SocketAddr) -> io::Result<(TcpStream, bool)> {
    socket.set_nonblocking(true)?;
    let pending = match socket.connect(&SockAddr::from(remote)) {
        Ok(()) => false,
        Err(e) if socket::connect_in_progress(&e) => true,
        Err(e) => return Err(e),
    };
    let stream = TcpStream::from_std(std::net::TcpStream::from(socket))?;
    Ok((stream, pending))
}

async fn wait_connected(stream: &TcpStream, timeout_secs: u32) -> Result<()> {
    let writable = stream.writable();
    let ready = if timeout_secs == 0 {
        writable.await
    } else {
        tokio::time::timeout(Duration::from_secs(u64::from(timeout_secs)), writable)
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                seconds: timeout_secs,
            })?
    };
    ready.map_err(|e| TransportError::io(Operation::Connect, e))?;

    if let Some(e) = stream
        .take_error()
        .map_err(|e| TransportError::io(Operation::Connect, e))?
    {
        return Err(TransportError::io(Operation::Connect, e));
    }
    stream
        .peer_addr()
        .map(|_| ())
        .map_err(|e| TransportError::io(Operation::Connect, e))
}

/// Holds a connection's single send slot; dropping it frees the slot.
struct SendPermit {
    inner: Arc<Inner>,
}

impl Drop for SendPermit {
    fn drop(&mut self) {
        self.inner.send_outstanding.store(false, Ordering::Release);
    }
}

/// A buffer lease for an outgoing send, obtained from
/// [`Connection::begin_send`].
///
/// Dereferences to the underlying [`Lease`]. Dropping it without passing it
/// to [`Connection::end_send`] cancels the send.
pub struct SendLease {
    lease: Lease,
    permit: SendPermit,
}

impl Deref for SendLease {
    type Target = Lease;

    fn deref(&self) -> &Lease {
        &self.lease
    }
}

impl DerefMut for SendLease {
    fn deref_mut(&mut self) -> &mut Lease {
        &mut self.lease
    }
}

impl fmt::Debug for SendLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendLease")
            .field("conn", &self.permit.inner.id)
            .field("lease", &self.lease)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::net::events::{ConnectionEvent, EventChannel};
    use crate::net::testing::PauseAtEvent;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tracing_subscriber::layer::SubscriberExt;

    fn test_pool() -> BufferPool {
        BufferPool::new(PoolConfig {
            items_per_page: 4,
            buffer_size: 256,
            sweep_interval: None,
            ..Default::default()
        })
        .unwrap()
    }

    fn channel_conn() -> (Connection, UnboundedReceiver<ConnectionEvent>) {
        let (sink, rx) = EventChannel::<ConnectionEvent>::new();
        let conn = Connection::new(ConnectionOptions::default(), sink, test_pool()).unwrap();
        (conn, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// An inherited connection plus the client end of its socket.
    async fn inherited(events: Arc<dyn ConnectionEvents>) -> (Connection, TcpStream) {
        let server = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener_addr = server.local_addr().unwrap();
        let peer = TcpStream::connect(listener_addr).await.unwrap();
        let (stream, peer_addr) = server.accept().await.unwrap();
        let accepted = AcceptedSocket {
            stream,
            peer_addr,
            listener_addr,
            runtime: Handle::current(),
        };
        let conn =
            Connection::inherit(accepted, ConnectionOptions::default(), events, test_pool()).unwrap();
        (conn, peer)
    }

    async fn next_event(rx: &mut UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[test]
    fn test_new_requires_runtime() {
        let result = Connection::new(ConnectionOptions::default(), Arc::new(()), test_pool());
        assert!(matches!(result, Err(TransportError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_bind_runs_once() {
        #[derive(Default)]
        struct CountBound(AtomicUsize);
        impl ConnectionEvents for CountBound {
            fn on_bound(&self, _conn: &Connection) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = Arc::new(CountBound::default());
        let conn =
            Connection::new(ConnectionOptions::default(), counter.clone(), test_pool()).unwrap();
        assert_eq!(conn.state(), ConnectionState::Created);

        conn.bind().unwrap();
        conn.bind_port(0).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnectionState::Bound);
        assert!(conn.local_addr().unwrap().ip().is_loopback());
        conn.dispose();
    }

    #[tokio::test]
    async fn test_bind_failure_reports_in_order() {
        let (conn, mut rx) = channel_conn();
        // TEST-NET-1 is never assigned to a local interface.
        conn.bind_addr("192.0.2.1".parse().unwrap(), 0).unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3, "{events:?}");
        assert!(matches!(&events[0], ConnectionEvent::Exception(info) if info.operation == Some(Operation::Bind)));
        assert_eq!(events[1], ConnectionEvent::BindFailed);
        assert_eq!(events[2], ConnectionEvent::Disposed);
        assert!(conn.is_disposed());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (conn, mut rx) = channel_conn();
        conn.dispose();
        conn.dispose();
        assert_eq!(drain(&mut rx), vec![ConnectionEvent::Disposed]);
        assert_eq!(conn.state(), ConnectionState::Disposed);

        // Later stages are silent no-ops.
        conn.bind().unwrap();
        conn.connect(socket::loopback(9)).unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_dispose_while_bound_reports_no_stage_failure() {
        let (conn, mut rx) = channel_conn();
        conn.bind().unwrap();
        conn.dispose();
        assert_eq!(
            drain(&mut rx),
            vec![ConnectionEvent::Bound, ConnectionEvent::Disposed]
        );
    }

    #[tokio::test]
    async fn test_send_rejected_before_connect() {
        let (conn, _rx) = channel_conn();
        assert!(matches!(conn.send(b"x"), Err(TransportError::NotConnected)));
        assert!(matches!(conn.begin_send(), Err(TransportError::NotConnected)));
        assert!(matches!(conn.mark_authenticated(), Err(TransportError::NotConnected)));

        conn.dispose();
        assert!(matches!(conn.send(b"x"), Err(TransportError::Disposed)));
    }

    #[tokio::test]
    async fn test_initialize_requires_inherited() {
        let (conn, _rx) = channel_conn();
        assert!(matches!(conn.initialize(), Err(TransportError::NotInherited)));
        assert!(!conn.is_inherited());
        assert!(!conn.is_authority());
    }

    #[tokio::test]
    async fn test_connect_refused_reports_connect_failed() {
        let port = {
            let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            closed.local_addr().unwrap().port()
        };
        let (conn, mut rx) = channel_conn();
        conn.connect(socket::loopback(port)).unwrap();

        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Bound);
        match next_event(&mut rx).await {
            ConnectionEvent::Exception(info) => {
                assert_eq!(info.operation, Some(Operation::Connect));
                assert_eq!(info.kind, Some(io::ErrorKind::ConnectionRefused));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::ConnectFailed);
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Disposed);
    }

    #[tokio::test]
    async fn test_user_token_round_trip() {
        let (conn, _rx) = channel_conn();
        assert!(conn.user_token().is_none());
        conn.set_user_token(String::from("session-7"));
        let token = conn.user_token().unwrap();
        assert_eq!(token.downcast_ref::<String>().unwrap(), "session-7");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dispose_during_initialize_suppresses_connected() {
        let (sink, mut rx) = EventChannel::<ConnectionEvent>::new();
        let (conn, _peer) = inherited(sink).await;

        // Park initialize() after it marks the connection connected but
        // before it notifies.
        let (layer, pause) = PauseAtEvent::new("Connection established");
        let worker = {
            let conn = conn.clone();
            std::thread::spawn(move || {
                let subscriber = tracing_subscriber::registry().with(layer);
                tracing::subscriber::with_default(subscriber, || conn.initialize())
            })
        };
        pause.wait_reached();
        conn.dispose();
        pause.release();
        worker.join().expect("initialize thread panicked").unwrap();

        assert_eq!(drain(&mut rx), vec![ConnectionEvent::Disposed]);
        assert!(!conn.is_connected());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disposed_waits_for_running_notification() {
        struct SlowConnected {
            entered: Mutex<mpsc::SyncSender<()>>,
            proceed: Mutex<mpsc::Receiver<()>>,
            seen: Mutex<Vec<ConnectionEvent>>,
        }
        impl ConnectionEvents for SlowConnected {
            fn on_connected(&self, _conn: &Connection) {
                let _ = self.entered.lock().send(());
                let _ = self.proceed.lock().recv_timeout(Duration::from_secs(5));
                self.seen.lock().push(ConnectionEvent::Connected);
            }
            fn on_disposed(&self, _conn: &Connection) {
                self.seen.lock().push(ConnectionEvent::Disposed);
            }
        }

        let (entered_tx, entered_rx) = mpsc::sync_channel(1);
        let (proceed_tx, proceed_rx) = mpsc::sync_channel(1);
        let sink = Arc::new(SlowConnected {
            entered: Mutex::new(entered_tx),
            proceed: Mutex::new(proceed_rx),
            seen: Mutex::new(Vec::new()),
        });
        let (conn, _peer) = inherited(sink.clone()).await;

        let worker = {
            let conn = conn.clone();
            std::thread::spawn(move || conn.initialize())
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        conn.dispose();
        assert!(conn.is_disposed());
        assert!(sink.seen.lock().is_empty(), "disposed raised while on_connected ran");

        proceed_tx.send(()).unwrap();
        worker.join().expect("initialize thread panicked").unwrap();
        assert_eq!(
            *sink.seen.lock(),
            vec![ConnectionEvent::Connected, ConnectionEvent::Disposed]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_failure_releases_lease_and_send_slot() {
        let (sink, mut rx) = EventChannel::<ConnectionEvent>::new();
        let (conn, _peer) = inherited(sink).await;
        let pool = conn.pool().clone();
        conn.initialize().unwrap();
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Connected);

        // Writes now fail with a broken pipe while reads stay healthy.
        let stream = conn.stream().unwrap();
        SockRef::from(&*stream)
            .shutdown(std::net::Shutdown::Write)
            .unwrap();
        drop(stream);
        conn.send(b"lost").unwrap();

        match next_event(&mut rx).await {
            ConnectionEvent::SendFailed(info) => assert_eq!(info.operation, Some(Operation::Send)),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::Exception(info) if info.operation == Some(Operation::Send)
        ));
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Disposed);
        assert!(rx.try_recv().is_err());

        assert!(!conn.inner.send_outstanding.load(Ordering::Acquire));
        assert_eq!(pool.stats().leased, 0);
        assert_eq!(conn.stats().bytes_sent, 0);
    }
}
