//! Listener Engine
//!
//! A [`Listener`] binds a socket, listens on it, and accepts peers until it
//! is disposed. Each accepted peer is handed to the consumer as an
//! [`AcceptedSocket`], typically wrapped straight into
//! [`Connection::inherit`](crate::Connection::inherit).
//!
//! # Performance-First Design:
//! - Connections already waiting in the backlog are accepted inline, in a loop
//! - Delivery runs on a fresh task so a slow consumer never stalls accepting
//! - Pausing stops issuing accepts; the listening socket stays open and the
//!   kernel keeps queueing peers in the backlog

use std::any::Any;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use socket2::Socket;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ListenerOptions, DEFAULT_BACKLOG};
use crate::error::{Operation, Result, TransportError};
use crate::lifecycle::{stage_failure, ListenerState, NotifyGate, StageFailure, StageFlag};
use crate::net::events::ListenerEvents;
use crate::net::next_endpoint_id;
use crate::net::socket::{self, SocketSettings};

/// A TCP listening endpoint. Cloning yields another handle to the same
/// listener.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    options: ListenerOptions,
    events: Arc<dyn ListenerEvents>,
    runtime: Handle,

    bind_attempted: StageFlag,
    bound: StageFlag,
    listen_attempted: StageFlag,
    listening: StageFlag,
    dispose_attempted: StageFlag,
    disposed: StageFlag,
    paused: watch::Sender<bool>,
    shutdown: CancellationToken,
    gate: NotifyGate,

    socket: Mutex<Option<Socket>>,
    listener: RwLock<Option<Arc<TcpListener>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    user_token: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    accepted: AtomicU64,
}

impl Listener {
    /// Create a listener. Must be called from within a tokio runtime.
    pub fn new(options: ListenerOptions, events: Arc<dyn ListenerEvents>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let (paused, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                id: next_endpoint_id(),
                options,
                events,
                runtime,
                bind_attempted: StageFlag::new(),
                bound: StageFlag::new(),
                listen_attempted: StageFlag::new(),
                listening: StageFlag::new(),
                dispose_attempted: StageFlag::new(),
                disposed: StageFlag::new(),
                paused,
                shutdown: CancellationToken::new(),
                gate: NotifyGate::new(),
                socket: Mutex::new(None),
                listener: RwLock::new(None),
                local_addr: Mutex::new(None),
                user_token: Mutex::new(None),
                accepted: AtomicU64::new(0),
            }),
        })
    }

    /// Returns the process-unique id used in this listener's log lines.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn options(&self) -> &ListenerOptions {
        &self.inner.options
    }

    /// Returns the furthest lifecycle stage reached.
    pub fn state(&self) -> ListenerState {
        let inner = &self.inner;
        if inner.disposed.is_set() {
            ListenerState::Disposed
        } else if inner.listening.is_set() {
            ListenerState::Listening
        } else if inner.bound.is_set() {
            ListenerState::Bound
        } else {
            ListenerState::Created
        }
    }

    pub fn is_bound(&self) -> bool {
        self.inner.bound.is_set()
    }

    /// Returns `true` while listening and not yet disposed.
    pub fn is_listening(&self) -> bool {
        self.inner.listening.is_set() && !self.is_disposed()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.is_set()
    }

    /// Returns `true` while accepting is paused.
    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    /// Returns the bound address, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Peers accepted so far, including any the consumer never saw because
    /// the listener was disposed first.
    pub fn accepted_count(&self) -> u64 {
        self.inner.accepted.load(Ordering::Relaxed)
    }

    /// Returns the token last stored with [`set_user_token`](Self::set_user_token).
    pub fn user_token(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.user_token.lock().clone()
    }

    pub fn set_user_token<T: Any + Send + Sync>(&self, token: T) {
        *self.inner.user_token.lock() = Some(Arc::new(token));
    }

    /// Raise a notification unless teardown has started.
    fn notify(&self, notify: impl FnOnce(&dyn ListenerEvents)) -> bool {
        let events = &*self.inner.events;
        self.inner
            .gate
            .run(|| notify(events), || self.notify_disposed())
    }

    fn notify_disposed(&self) {
        info!(
            listener = self.inner.id,
            accepted = self.inner.accepted.load(Ordering::Relaxed),
            "Listener disposed"
        );
        self.inner.events.on_disposed(self);
    }

    // ---- Bind -----------------------------------------------------------

    /// Bind to an ephemeral IPv4 loopback port.
    pub fn bind(&self) {
        self.bind_to(socket::loopback(0));
    }

    /// Bind to `port` on IPv4 loopback.
    pub fn bind_port(&self, port: u16) {
        self.bind_to(socket::loopback(port));
    }

    /// Bind to `ip:port`.
    pub fn bind_addr(&self, ip: IpAddr, port: u16) {
        self.bind_to(SocketAddr::new(ip, port));
    }

    /// Create the socket and bind it to `local`. Only the first call does
    /// anything; failures dispose the listener.
    pub fn bind_to(&self, local: SocketAddr) {
        let outcome = {
            let mut slot = self.inner.socket.lock();
            if self.is_disposed() || !self.inner.bind_attempted.try_claim() {
                return;
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
                debug!(listener = self.inner.id, local = %addr, "Listener bound");
                self.notify(|events| events.on_bound(self));
            }
            Err(e) => self.fault(TransportError::io(Operation::Bind, e)),
        }
    }

    // ---- Listen ---------------------------------------------------------

    /// Start listening with the configured backlog.
    pub fn listen(&self) {
        self.listen_with_backlog(self.inner.options.backlog);
    }

    /// Start listening, binding first if needed, and begin accepting.
    pub fn listen_with_backlog(&self, backlog: u32) {
        if self.is_disposed() || !self.inner.listen_attempted.try_claim() {
            return;
        }

        self.bind();
        let Some(socket) = self.inner.socket.lock().take() else {
            return;
        };

        let _enter = self.inner.runtime.enter();
        let backlog = if backlog == 0 { DEFAULT_BACKLOG } else { backlog };
        let (listener, local) = match start_listening(socket, backlog) {
            Ok(started) => started,
            Err(e) => {
                self.fault(TransportError::io(Operation::Listen, e));
                return;
            }
        };

        let listener = Arc::new(listener);
        {
            let mut slot = self.inner.listener.write();
            if self.is_disposed() {
                return;
            }
            *slot = Some(listener.clone());
            self.inner.listening.set();
        }
        info!(listener = self.inner.id, %local, backlog, "Listening");

        if !self.notify(|events| events.on_listening(self)) || self.is_disposed() {
            return;
        }
        self.accept_loop(listener, local);
    }

    // ---- Accept ---------------------------------------------------------

    fn accept_loop(&self, listener: Arc<TcpListener>, local: SocketAddr) {
        loop {
            if self.is_disposed() {
                return;
            }
            if self.is_paused() {
                break;
            }
            match listener.accept().now_or_never() {
                Some(result) => {
                    if !self.complete_accept(result, local) {
                        return;
                    }
                }
                None => break,
            }
        }
        self.await_accept(listener, local);
    }

    fn await_accept(&self, listener: Arc<TcpListener>, local: SocketAddr) {
        let this = self.clone();
        self.inner.runtime.spawn(async move {
            let mut paused = this.inner.paused.subscribe();
            let result = loop {
                if *paused.borrow_and_update() {
                    tokio::select! {
                        _ = this.inner.shutdown.cancelled() => return,
                        _ = paused.changed() => continue,
                    }
                }
                tokio::select! {
                    _ = this.inner.shutdown.cancelled() => return,
                    _ = paused.changed() => continue,
                    result = listener.accept() => break result,
                }
            };
            if this.complete_accept(result, local) {
                this.accept_loop(listener, local);
            }
        });
    }

    /// Classify one accept outcome. Returns whether to keep accepting.
    fn complete_accept(&self, result: io::Result<(TcpStream, SocketAddr)>, local: SocketAddr) -> bool {
        if self.is_disposed() {
            return false;
        }
        match result {
            Ok((stream, peer_addr)) => {
                if let Err(e) = stream.set_nodelay(self.inner.options.no_delay) {
                    debug!(listener = self.inner.id, %peer_addr, error = %e, "Could not set no-delay");
                }
                self.inner.accepted.fetch_add(1, Ordering::Relaxed);
                debug!(listener = self.inner.id, %peer_addr, "Accepted connection");

                let accepted = AcceptedSocket {
                    stream,
                    peer_addr,
                    listener_addr: local,
                    runtime: self.inner.runtime.clone(),
                };
                let this = self.clone();
                self.inner.runtime.spawn(async move {
                    this.notify(|events| events.on_socket_connected(&this, accepted));
                });
                true
            }
            Err(e) if socket::is_peer_abort(&e) => {
                debug!(listener = self.inner.id, error = %e, "Peer gave up before accept");
                true
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => true,
            Err(e) => {
                self.fault(TransportError::io(Operation::Accept, e));
                false
            }
        }
    }

    // ---- Pause / resume -------------------------------------------------

    /// Stop accepting new peers. The socket stays open and the kernel keeps
    /// queueing connection attempts up to the backlog.
    pub fn pause(&self) {
        if !self.inner.paused.send_replace(true) {
            debug!(listener = self.inner.id, "Accepting paused");
        }
    }

    /// Resume accepting, starting with peers queued while paused.
    pub fn resume(&self) {
        if self.inner.paused.send_replace(false) {
            debug!(listener = self.inner.id, "Accepting resumed");
        }
    }

    // ---- Teardown -------------------------------------------------------

    /// Close the listener. Idempotent and safe from inside a notification.
    pub fn dispose(&self) {
        if self.inner.dispose_attempted.try_claim() {
            self.teardown(None);
        }
    }

    fn fault(&self, error: TransportError) {
        if self.inner.dispose_attempted.try_claim() {
            warn!(listener = self.inner.id, %error, "Listener fault");
            self.teardown(Some(error));
        }
    }

    fn teardown(&self, error: Option<TransportError>) {
        let inner = &self.inner;
        inner.disposed.set();
        inner.gate.close();
        inner.shutdown.cancel();
        drop(inner.socket.lock().take());
        drop(inner.listener.write().take());

        if let Some(error) = &error {
            inner.events.on_exception(self, error);
        }
        match stage_failure(
            &inner.bind_attempted,
            &inner.bound,
            &inner.listen_attempted,
            &inner.listening,
        ) {
            StageFailure::Bind => inner.events.on_bind_failed(self),
            StageFailure::Second => inner.events.on_listen_failed(self),
            StageFailure::None => {}
        }

        inner.gate.finish(|| self.notify_disposed());
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("paused", &self.is_paused())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

fn start_listening(socket: Socket, backlog: u32) -> io::Result<(TcpListener, SocketAddr)> {
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    socket.set_nonblocking(true)?;
    let listener = TcpListener::from_std(std::net::TcpListener::from(socket))?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}

/// A connected socket produced by a [`Listener`].
pub struct AcceptedSocket {
    pub(crate) stream: TcpStream,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) listener_addr: SocketAddr,
    pub(crate) runtime: Handle,
}

impl AcceptedSocket {
    /// Returns the remote address of the accepted peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Address of the listener that accepted the peer.
    pub fn listener_addr(&self) -> SocketAddr {
        self.listener_addr
    }

    /// Take the raw stream, bypassing the connection engine.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

impl fmt::Debug for AcceptedSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptedSocket")
            .field("peer_addr", &self.peer_addr)
            .field("listener_addr", &self.listener_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::events::{EventChannel, ListenerEvent};
    use crate::net::testing::PauseAtEvent;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tracing_subscriber::layer::SubscriberExt;

    fn channel_listener() -> (Listener, UnboundedReceiver<ListenerEvent>) {
        let (sink, rx) = EventChannel::<ListenerEvent>::new();
        let listener = Listener::new(ListenerOptions::default(), sink).unwrap();
        (listener, rx)
    }

    async fn next_event(rx: &mut UnboundedReceiver<ListenerEvent>) -> ListenerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[test]
    fn test_new_requires_runtime() {
        let result = Listener::new(ListenerOptions::default(), Arc::new(()));
        assert!(matches!(result, Err(TransportError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_listen_binds_implicitly_once() {
        let (listener, mut rx) = channel_listener();
        listener.listen();
        listener.listen();
        listener.bind_port(0);

        assert!(matches!(next_event(&mut rx).await, ListenerEvent::Bound));
        assert!(matches!(next_event(&mut rx).await, ListenerEvent::Listening));
        assert!(rx.try_recv().is_err());

        assert_eq!(listener.state(), ListenerState::Listening);
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        listener.dispose();
    }

    #[tokio::test]
    async fn test_bind_failure_reports_in_order() {
        let (listener, mut rx) = channel_listener();
        listener.bind_addr("192.0.2.1".parse().unwrap(), 0);
        listener.listen();

        assert!(matches!(
            next_event(&mut rx).await,
            ListenerEvent::Exception(info) if info.operation == Some(Operation::Bind)
        ));
        assert!(matches!(next_event(&mut rx).await, ListenerEvent::BindFailed));
        assert!(matches!(next_event(&mut rx).await, ListenerEvent::Disposed));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_accepts_peer() {
        let (listener, mut rx) = channel_listener();
        listener.listen();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let socket = loop {
            if let ListenerEvent::SocketConnected(socket) = next_event(&mut rx).await {
                break socket;
            }
        };
        assert_eq!(socket.peer_addr(), client.local_addr().unwrap());
        assert_eq!(socket.listener_addr(), addr);
        assert_eq!(listener.accepted_count(), 1);
        listener.dispose();
    }

    #[tokio::test]
    async fn test_pause_holds_peers_in_backlog() {
        let (listener, mut rx) = channel_listener();
        listener.listen();
        listener.pause();
        assert!(listener.is_paused());
        let addr = listener.local_addr().unwrap();

        // The handshake completes against the backlog even while paused.
        let _client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, ListenerEvent::SocketConnected(_)));
        }
        assert_eq!(listener.accepted_count(), 0);

        listener.resume();
        loop {
            if let ListenerEvent::SocketConnected(_) = next_event(&mut rx).await {
                break;
            }
        }
        assert_eq!(listener.accepted_count(), 1);
        listener.dispose();
    }

    #[tokio::test]
    async fn test_dispose_after_listen_reports_no_stage_failure() {
        let (listener, mut rx) = channel_listener();
        listener.listen();
        listener.dispose();
        listener.dispose();

        assert!(matches!(next_event(&mut rx).await, ListenerEvent::Bound));
        assert!(matches!(next_event(&mut rx).await, ListenerEvent::Listening));
        assert!(matches!(next_event(&mut rx).await, ListenerEvent::Disposed));
        assert!(rx.try_recv().is_err());
        assert_eq!(listener.state(), ListenerState::Disposed);
    }

    #[derive(Default)]
    struct StageCounts {
        bound: AtomicUsize,
        listening: AtomicUsize,
        disposed: AtomicUsize,
        after_disposed: AtomicUsize,
    }

    impl StageCounts {
        fn record(&self, counter: &AtomicUsize) {
            if self.disposed.load(Ordering::SeqCst) > 0 {
                self.after_disposed.fetch_add(1, Ordering::SeqCst);
            }
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl ListenerEvents for StageCounts {
        fn on_bound(&self, _listener: &Listener) {
            self.record(&self.bound);
        }
        fn on_listening(&self, _listener: &Listener) {
            self.record(&self.listening);
        }
        fn on_disposed(&self, _listener: &Listener) {
            self.record(&self.disposed);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_listen_runs_once() {
        let counts = Arc::new(StageCounts::default());
        let listener = Listener::new(ListenerOptions::default(), counts.clone()).unwrap();

        std::thread::scope(|scope| {
            for i in 0..8 {
                let listener = &listener;
                scope.spawn(move || {
                    if i % 2 == 0 {
                        listener.listen();
                    } else {
                        listener.bind();
                    }
                });
            }
        });

        assert_eq!(counts.bound.load(Ordering::SeqCst), 1);
        assert_eq!(counts.listening.load(Ordering::SeqCst), 1);
        assert_eq!(listener.state(), ListenerState::Listening);
        listener.dispose();
        assert_eq!(counts.disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_listen_and_dispose() {
        for _ in 0..50 {
            let counts = Arc::new(StageCounts::default());
            let listener = Listener::new(ListenerOptions::default(), counts.clone()).unwrap();

            std::thread::scope(|scope| {
                for i in 0..6 {
                    let listener = &listener;
                    scope.spawn(move || match i % 3 {
                        0 => listener.listen(),
                        1 => listener.bind(),
                        _ => listener.dispose(),
                    });
                }
            });

            assert!(counts.bound.load(Ordering::SeqCst) <= 1);
            assert!(counts.listening.load(Ordering::SeqCst) <= 1);
            assert_eq!(counts.disposed.load(Ordering::SeqCst), 1);
            assert_eq!(counts.after_disposed.load(Ordering::SeqCst), 0);
            assert_eq!(listener.state(), ListenerState::Disposed);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dispose_during_listen_suppresses_listening() {
        let (listener, mut rx) = channel_listener();

        // Park listen() after it marks the listener listening but before it
        // notifies.
        let (layer, pause) = PauseAtEvent::new("Listening");
        let worker = {
            let listener = listener.clone();
            std::thread::spawn(move || {
                let subscriber = tracing_subscriber::registry().with(layer);
                tracing::subscriber::with_default(subscriber, || listener.listen());
            })
        };
        pause.wait_reached();
        listener.dispose();
        pause.release();
        worker.join().expect("listen thread panicked");

        assert!(matches!(next_event(&mut rx).await, ListenerEvent::Bound));
        assert!(matches!(next_event(&mut rx).await, ListenerEvent::Disposed));
        assert!(rx.try_recv().is_err());
    }
}
