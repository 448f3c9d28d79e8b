//! The transport context: link registry, event queue, wake primitive and the
//! tasks that own each socket.
//!
//! One [`Transport`] value is one independent instance; several may run
//! concurrently in a process. All shared state sits behind a single mutex,
//! which is never held across an await point and always released before a
//! callback fires. Each socket is owned by exactly one tokio task which
//! drives connect, TLS handshake, reads, writes and timeouts, and reports
//! every deliverable transition back as a queued event.
//!
//! Progress is made either by a caller invoking [`Transport::wait`] /
//! [`Transport::flush`] from its own loop, or by the optional background
//! worker which signals readiness through per-link `wake` callbacks. The one
//! forbidden pattern is calling `wait` from inside a dispatched callback.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::buffer::{Buffer, BufferPool, POOL_BUFFER_CAPACITY};
use crate::error::TransportError;
use crate::event::{LinkEvent, LinkEvents};
use crate::link::{HandshakeSide, LinkCmd, LinkEntry, LinkId, LinkState, Role, Token};
use crate::tls::{IoStream, TlsContext};

/// Outbound backlog depth at which the `send_wait` hint fires.
const SEND_WAIT_THRESHOLD: usize = 64 * 1024;

/// Stand-in deadline for links with no timeout configured.
const FAR_FUTURE: Duration = Duration::from_secs(86_400);

/// Configuration for a [`Transport`].
#[derive(Default)]
pub struct TransportBuilder {
    worker: bool,
    closing_timeout: Option<Duration>,
    tls_client: Option<Arc<rustls::ClientConfig>>,
    tls_server: Option<Arc<rustls::ServerConfig>>,
}

impl TransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs a background worker that observes event arrival and signals the
    /// affected links' `wake` callbacks. Off by default; without it the
    /// caller drives everything through `wait`/`flush`.
    pub fn background_worker(mut self, enabled: bool) -> Self {
        self.worker = enabled;
        self
    }

    /// Bound on how long a link may sit in `Closing` without a terminal
    /// socket event before it is force-terminated. Defaults to 5 seconds.
    pub fn closing_timeout(mut self, timeout: Duration) -> Self {
        self.closing_timeout = Some(timeout);
        self
    }

    /// TLS configuration used for outbound handshakes. Defaults to the
    /// webpki root store with no client auth.
    pub fn tls_client_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_client = Some(config);
        self
    }

    /// TLS configuration for accepted sockets; required before `listen`
    /// with the TLS flag succeeds.
    pub fn tls_server_config(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls_server = Some(config);
        self
    }

    /// Builds the transport. Must be called from within a tokio runtime,
    /// which the transport captures for its link tasks.
    pub fn build(self) -> Transport {
        let inner = Arc::new(Inner {
            shared: Mutex::new(Shared {
                links: HashMap::new(),
                ready: VecDeque::new(),
                pool: BufferPool::new(),
                next_id: 1,
            }),
            readiness: Notify::new(),
            tls: TlsContext::new(self.tls_client, self.tls_server),
            closing_timeout: self.closing_timeout.unwrap_or(Duration::from_secs(5)),
            runtime: tokio::runtime::Handle::current(),
            stopped: AtomicBool::new(false),
        });

        if self.worker {
            inner.runtime.spawn(run_worker(Arc::downgrade(&inner)));
        }

        Transport { inner }
    }
}

impl fmt::Debug for TransportBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportBuilder")
            .field("worker", &self.worker)
            .field("closing_timeout", &self.closing_timeout)
            .finish()
    }
}

/// Handle to one transport instance. Cheap to clone; all clones share the
/// same registry, pool and event queue.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    shared: Mutex<Shared>,
    /// The wake primitive: rouses `wait` and the background worker.
    readiness: Notify,
    tls: TlsContext,
    closing_timeout: Duration,
    runtime: tokio::runtime::Handle,
    stopped: AtomicBool,
}

struct Shared {
    links: HashMap<LinkId, LinkEntry>,
    /// Links with undispatched events, each present at most once.
    ready: VecDeque<LinkId>,
    pool: BufferPool,
    next_id: u64,
}

/// One callback invocation, extracted under the lock, fired outside it.
enum Dispatch {
    Incoming { handler: Arc<dyn LinkEvents>, listener: Token, child: LinkId },
    Recv { handler: Arc<dyn LinkEvents>, token: Token, buffer: Buffer },
    SendReady { handler: Arc<dyn LinkEvents>, token: Token, queued: usize },
    SendWait { handler: Arc<dyn LinkEvents>, token: Token, queued: usize },
    SendFinished { handler: Arc<dyn LinkEvents>, token: Token },
    Timeout { handler: Arc<dyn LinkEvents>, token: Token },
    Closed { handler: Arc<dyn LinkEvents>, token: Token },
}

impl Transport {
    pub fn builder() -> TransportBuilder {
        TransportBuilder::new()
    }

    /// Opens an outbound link to `host:port`.
    ///
    /// Resolution and TLS-name validation happen synchronously and fail
    /// fast; the connect itself is asynchronous and reports failure as a
    /// `closed` event. Events for the link are delivered to `handler` under
    /// `token`.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        tls: bool,
        token: Token,
        handler: Arc<dyn LinkEvents>,
    ) -> Result<LinkId, TransportError> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| TransportError::resolve(host, port, e))?
            .collect();
        if addrs.is_empty() {
            let e = io::Error::new(io::ErrorKind::NotFound, "no addresses");
            return Err(TransportError::resolve(host, port, e));
        }

        let server_name = if tls { Some(TlsContext::server_name(host)?) } else { None };

        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut guard = self.inner.lock();
            let shared = &mut *guard;
            let id = shared.alloc_id();
            shared
                .links
                .insert(id, LinkEntry::new(Role::Outbound, LinkState::Connecting, token, handler, tx));
            id
        };

        debug!(%id, host, port, tls, "connecting");
        self.inner
            .runtime
            .spawn(run_outbound(Arc::clone(&self.inner), id, addrs, server_name, rx));
        self.wake();
        Ok(id)
    }

    /// Binds a listening link on all interfaces.
    ///
    /// Accepted sockets spawn child links that inherit `handler` and the
    /// listener's TLS role; each child is announced through an `incoming`
    /// event, whose return value becomes the child's token.
    pub fn listen(
        &self,
        port: u16,
        tls: bool,
        token: Token,
        handler: Arc<dyn LinkEvents>,
    ) -> Result<LinkId, TransportError> {
        if tls && !self.inner.tls.has_acceptor() {
            return Err(TransportError::MissingTlsServerConfig);
        }

        let listener =
            StdTcpListener::bind(("0.0.0.0", port)).map_err(|e| TransportError::bind(port, e))?;
        listener.set_nonblocking(true)?;
        let local_port = listener.local_addr()?.port();

        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut guard = self.inner.lock();
            let shared = &mut *guard;
            let id = shared.alloc_id();
            let mut entry = LinkEntry::new(Role::Listener, LinkState::Ready, token, handler, tx);
            entry.local_port = Some(local_port);
            shared.links.insert(id, entry);
            id
        };

        debug!(%id, port = local_port, tls, "listening");
        self.inner.runtime.spawn(run_listener(Arc::clone(&self.inner), id, listener, tls, rx));
        Ok(id)
    }

    /// Replaces the link's activity timeout. `None` disables it. Shortening
    /// a timeout wakes the owning task so the new deadline takes effect
    /// immediately rather than at the next natural wakeup.
    pub fn set_timeout(
        &self,
        link: LinkId,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        {
            let mut guard = self.inner.lock();
            let entry = guard.links.get_mut(&link).ok_or(TransportError::UnknownLink(link))?;
            entry.timeout = timeout;
            let _ = entry.cmds.send(LinkCmd::Retime(timeout));
        }
        self.wake();
        Ok(())
    }

    /// Caller-initiated shutdown: half-closes the socket immediately, stops
    /// all further event delivery for the link, and lets the owning task
    /// finish the teardown. Non-blocking; the registry entry disappears once
    /// the socket produces a terminal event or the closing-timeout fires.
    pub fn close(&self, link: LinkId) {
        {
            let mut guard = self.inner.lock();
            let shared = &mut *guard;
            let Some(entry) = shared.links.get_mut(&link) else {
                return;
            };
            entry.caller_closed = true;
            entry.pending.clear();
            if entry.state == LinkState::Terminated {
                shared.remove(link);
            } else {
                entry.state = LinkState::Closing;
                let _ = entry.cmds.send(LinkCmd::Shutdown);
            }
        }
        debug!(%link, "close requested");
        self.wake();
    }

    /// Hands out a send buffer of capacity at least `min_size`, pool-backed
    /// when small enough. The caller fills it and passes ownership back via
    /// [`queue_send_buffer`](Self::queue_send_buffer).
    pub fn allocate_send_buffer(&self, min_size: usize) -> Buffer {
        self.inner.lock().pool.allocate(min_size)
    }

    /// Queues a filled buffer for transmission on `link`. Ownership moves to
    /// the link until the bytes are fully written, after which the buffer
    /// returns to the pool.
    pub fn queue_send_buffer(&self, link: LinkId, buffer: Buffer) -> Result<(), TransportError> {
        {
            let mut guard = self.inner.lock();
            let shared = &mut *guard;
            let Some(entry) = shared.links.get_mut(&link) else {
                shared.pool.release(buffer);
                return Err(TransportError::UnknownLink(link));
            };
            if entry.caller_closed
                || matches!(entry.state, LinkState::Closing | LinkState::Terminated)
            {
                shared.pool.release(buffer);
                return Err(TransportError::LinkClosing(link));
            }

            entry.queued_send_bytes += buffer.len();
            let backlog = entry.queued_send_bytes;
            let _ = entry.cmds.send(LinkCmd::Send(buffer));
            if backlog > SEND_WAIT_THRESHOLD {
                self.inner.push_event(shared, link, LinkEvent::SendWait(backlog));
            }
        }
        self.wake();
        Ok(())
    }

    /// Returns a buffer previously delivered through a `recv` event to the
    /// pool.
    pub fn release_recv_buffer(&self, buffer: Buffer) {
        self.inner.lock().pool.release(buffer);
    }

    /// Blocks until some event is ready or `timeout` elapses, then
    /// dispatches every ready callback. Returns whether anything was
    /// dispatched.
    ///
    /// Must not be called from inside a dispatched callback.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.readiness.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.flush() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.flush();
            }
        }
    }

    /// Dispatches already-ready callbacks without blocking or polling.
    /// Returns whether anything was dispatched.
    pub fn flush(&self) -> bool {
        let mut dispatched = false;
        while let Some(item) = self.inner.next_dispatch() {
            dispatched = true;
            self.inner.dispatch(item);
        }
        dispatched
    }

    /// Interrupts a blocked [`wait`](Self::wait) (and the background
    /// worker), so state changed outside the event machinery is observed
    /// promptly.
    pub fn wake(&self) {
        self.inner.readiness.notify_waiters();
    }

    /// Current lifecycle state of a link, if it is still registered.
    pub fn link_state(&self, link: LinkId) -> Option<LinkState> {
        self.inner.lock().links.get(&link).map(|e| e.state)
    }

    /// Bound port of a listening link.
    pub fn local_port(&self, link: LinkId) -> Result<u16, TransportError> {
        self.inner
            .lock()
            .links
            .get(&link)
            .and_then(|e| e.local_port)
            .ok_or(TransportError::UnknownLink(link))
    }

    /// Orderly teardown: closes every registered link and stops the
    /// background worker. Outstanding events are dropped.
    pub fn shutdown(&self) {
        let ids: Vec<LinkId> = self.inner.lock().links.keys().copied().collect();
        for id in ids {
            self.close(id);
        }
        self.inner.stopped.store(true, Ordering::Release);
        self.wake();
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.lock();
        f.debug_struct("Transport")
            .field("links", &guard.links.len())
            .field("ready", &guard.ready.len())
            .finish()
    }
}

impl Shared {
    fn alloc_id(&mut self) -> LinkId {
        let id = LinkId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Drops a registry entry, returning its undelivered buffers to the
    /// pool.
    fn remove(&mut self, link: LinkId) {
        if let Some(entry) = self.links.remove(&link) {
            for buffer in entry.inbound {
                self.pool.release(buffer);
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queues `event` for `link` and makes the link a member of the ready
    /// queue exactly once until dispatched.
    fn push_event(&self, shared: &mut Shared, link: LinkId, event: LinkEvent) {
        let Some(entry) = shared.links.get_mut(&link) else {
            return;
        };
        if !entry.accepts_events() {
            return;
        }
        entry.pending.push_back(event);
        if !entry.in_ready_queue {
            entry.in_ready_queue = true;
            shared.ready.push_back(link);
        }
        self.readiness.notify_waiters();
    }

    fn set_state(&self, link: LinkId, state: LinkState) {
        let mut guard = self.lock();
        if let Some(entry) = guard.links.get_mut(&link) {
            trace!(%link, ?state, "state transition");
            entry.state = state;
        }
    }

    fn alloc_recv_buffer(&self) -> Buffer {
        self.lock().pool.allocate(POOL_BUFFER_CAPACITY)
    }

    fn release_buffer(&self, buffer: Buffer) {
        self.lock().pool.release(buffer);
    }

    /// Appends a received buffer to the link's inbound queue and queues a
    /// `recv` event. Buffers arriving for a closing link go straight back to
    /// the pool.
    fn deliver_recv(&self, link: LinkId, buffer: Buffer) {
        let mut guard = self.lock();
        let shared = &mut *guard;
        let deliver = shared
            .links
            .get(&link)
            .is_some_and(|e| e.accepts_events() && e.state != LinkState::Terminated);
        if !deliver {
            shared.pool.release(buffer);
            return;
        }
        if let Some(entry) = shared.links.get_mut(&link) {
            entry.inbound.push_back(buffer);
        }
        self.push_event(shared, link, LinkEvent::Recv);
    }

    /// Bookkeeping after one outbound buffer was fully transmitted.
    fn after_send(&self, link: LinkId, sent: usize, drained: bool) {
        let mut guard = self.lock();
        let shared = &mut *guard;
        let Some(entry) = shared.links.get_mut(&link) else {
            return;
        };
        entry.queued_send_bytes = entry.queued_send_bytes.saturating_sub(sent);
        let backlog = entry.queued_send_bytes;
        self.push_event(shared, link, LinkEvent::SendReady(backlog));
        if drained {
            self.push_event(shared, link, LinkEvent::SendFinished);
        }
    }

    fn push_simple(&self, link: LinkId, event: LinkEvent) {
        let mut guard = self.lock();
        self.push_event(&mut guard, link, event);
    }

    /// Marks a link terminated. If the caller already closed it the entry is
    /// removed outright; otherwise a `closed` event is queued.
    fn finish(&self, link: LinkId) {
        let mut guard = self.lock();
        let shared = &mut *guard;
        let Some(entry) = shared.links.get_mut(&link) else {
            return;
        };
        entry.state = LinkState::Terminated;
        if entry.caller_closed {
            shared.remove(link);
        } else {
            self.push_event(shared, link, LinkEvent::Closed);
        }
    }

    /// Pops the next dispatchable event, preserving per-link order and
    /// round-robining across links.
    fn next_dispatch(&self) -> Option<Dispatch> {
        let mut guard = self.lock();
        let shared = &mut *guard;
        loop {
            let link = shared.ready.pop_front()?;

            let mut requeue = false;
            let mut release = None;
            let item = {
                let Some(entry) = shared.links.get_mut(&link) else {
                    continue;
                };
                entry.wake_signalled = false;
                let Some(event) = entry.pending.pop_front() else {
                    entry.in_ready_queue = false;
                    continue;
                };
                requeue = !entry.pending.is_empty();
                entry.in_ready_queue = requeue;

                if entry.accepts_events() {
                    let token = entry.token;
                    let handler = Arc::clone(&entry.handler);
                    match event {
                        LinkEvent::Incoming(child) => {
                            Some(Dispatch::Incoming { handler, listener: token, child })
                        }
                        LinkEvent::Recv => entry
                            .inbound
                            .pop_front()
                            .map(|buffer| Dispatch::Recv { handler, token, buffer }),
                        LinkEvent::SendReady(queued) => {
                            Some(Dispatch::SendReady { handler, token, queued })
                        }
                        LinkEvent::SendWait(queued) => {
                            Some(Dispatch::SendWait { handler, token, queued })
                        }
                        LinkEvent::SendFinished => Some(Dispatch::SendFinished { handler, token }),
                        LinkEvent::Timeout => Some(Dispatch::Timeout { handler, token }),
                        LinkEvent::Closed => Some(Dispatch::Closed { handler, token }),
                    }
                } else {
                    if matches!(event, LinkEvent::Recv) {
                        release = entry.inbound.pop_front();
                    }
                    None
                }
            };

            if let Some(buffer) = release {
                shared.pool.release(buffer);
            }
            if requeue {
                shared.ready.push_back(link);
            }
            if let Some(item) = item {
                return Some(item);
            }
        }
    }

    /// Fires one callback. The lock is not held here; `incoming` re-locks
    /// afterwards to bind the returned token to the child link.
    fn dispatch(&self, item: Dispatch) {
        match item {
            Dispatch::Incoming { handler, listener, child } => {
                let token = handler.incoming(listener, child);
                let mut guard = self.lock();
                if let Some(entry) = guard.links.get_mut(&child) {
                    entry.token = token;
                }
            }
            Dispatch::Recv { handler, token, buffer } => handler.recv(token, buffer),
            Dispatch::SendReady { handler, token, queued } => handler.send_ready(token, queued),
            Dispatch::SendWait { handler, token, queued } => handler.send_wait(token, queued),
            Dispatch::SendFinished { handler, token } => handler.send_finished(token),
            Dispatch::Timeout { handler, token } => handler.timeout(token),
            Dispatch::Closed { handler, token } => handler.closed(token),
        }
    }

    /// Collects (handler, token) pairs the background worker should signal:
    /// links with pending events that have not been woken for the current
    /// batch yet.
    fn wake_targets(&self) -> Vec<(Arc<dyn LinkEvents>, Token)> {
        let mut guard = self.lock();
        let shared = &mut *guard;
        let ready: Vec<LinkId> = shared.ready.iter().copied().collect();
        let mut targets = Vec::new();
        for link in ready {
            if let Some(entry) = shared.links.get_mut(&link) {
                if entry.accepts_events() && !entry.wake_signalled {
                    entry.wake_signalled = true;
                    targets.push((Arc::clone(&entry.handler), entry.token));
                }
            }
        }
        targets
    }
}

/// Background worker: observes event arrival and nudges the affected
/// handlers' `wake` callbacks so externally-driven callers know to flush.
async fn run_worker(weak: Weak<Inner>) {
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.stopped.load(Ordering::Acquire) {
            return;
        }

        let notified = inner.readiness.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let targets = inner.wake_targets();
        if targets.is_empty() {
            // bounded so worker liveness never depends on a wake arriving
            let _ = tokio::time::timeout(Duration::from_millis(250), notified).await;
        } else {
            for (handler, token) in targets {
                handler.wake(token);
            }
        }
    }
}

/// Task owning an outbound socket: connect, optional handshake, then I/O.
async fn run_outbound(
    inner: Arc<Inner>,
    id: LinkId,
    addrs: Vec<SocketAddr>,
    server_name: Option<ServerName<'static>>,
    cmds: mpsc::UnboundedReceiver<LinkCmd>,
) {
    let stream = match TcpStream::connect(&addrs[..]).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(%id, error = %e, "connect failed");
            inner.finish(id);
            return;
        }
    };

    let stream = if let Some(name) = server_name {
        inner.set_state(id, LinkState::Handshaking(HandshakeSide::Connect));
        match inner.tls.client_handshake(name, stream).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(%id, error = %e, "tls handshake failed");
                inner.finish(id);
                return;
            }
        }
    } else {
        IoStream::Plain(stream)
    };

    inner.set_state(id, LinkState::Ready);
    inner.after_send(id, 0, false); // send_ready: the link is writable now
    run_io(inner, id, stream, cmds).await;
}

/// Task owning an accepted socket: optional handshake, then I/O.
async fn run_inbound(
    inner: Arc<Inner>,
    id: LinkId,
    stream: TcpStream,
    tls: bool,
    cmds: mpsc::UnboundedReceiver<LinkCmd>,
) {
    let stream = if tls {
        match inner.tls.server_handshake(stream).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(%id, error = %e, "tls accept failed");
                inner.finish(id);
                return;
            }
        }
    } else {
        IoStream::Plain(stream)
    };

    inner.set_state(id, LinkState::Ready);
    run_io(inner, id, stream, cmds).await;
}

/// Task owning a listening socket: accepts children until shut down.
async fn run_listener(
    inner: Arc<Inner>,
    id: LinkId,
    listener: StdTcpListener,
    tls: bool,
    mut cmds: mpsc::UnboundedReceiver<LinkCmd>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            warn!(%id, error = %e, "listener registration failed");
            inner.finish(id);
            return;
        }
    };

    loop {
        tokio::select! {
            cmd = cmds.recv() => match cmd {
                Some(LinkCmd::Shutdown) | None => break,
                Some(LinkCmd::Send(buffer)) => inner.release_buffer(buffer),
                Some(LinkCmd::Retime(_)) => {}
            },
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let spawned = register_child(&inner, id, tls);
                    if let Some((child, rx)) = spawned {
                        trace!(%id, %child, %peer, "accepted");
                        inner.runtime.spawn(run_inbound(Arc::clone(&inner), child, stream, tls, rx));
                    }
                }
                Err(e) => {
                    warn!(%id, error = %e, "accept failed");
                }
            },
        }
    }

    inner.finish(id);
}

/// Registers a child link for an accepted socket, inheriting the listener's
/// handler and TLS role, and queues the `incoming` event.
fn register_child(
    inner: &Arc<Inner>,
    listener: LinkId,
    tls: bool,
) -> Option<(LinkId, mpsc::UnboundedReceiver<LinkCmd>)> {
    let mut guard = inner.lock();
    let shared = &mut *guard;
    let parent = shared.links.get(&listener)?;
    if !parent.accepts_events() {
        return None;
    }
    let handler = Arc::clone(&parent.handler);
    let initial =
        if tls { LinkState::Handshaking(HandshakeSide::Accept) } else { LinkState::Ready };
    let (tx, rx) = mpsc::unbounded_channel();
    let child = shared.alloc_id();
    shared.links.insert(child, LinkEntry::new(Role::Inbound, initial, 0, handler, tx));
    inner.push_event(shared, listener, LinkEvent::Incoming(child));
    Some((child, rx))
}

enum IoOutcome {
    Eof,
    Error,
    ForcedClose,
}

/// The steady-state loop for one established socket: reads into pooled
/// buffers, drains the outbound queue, tracks the activity timeout and the
/// closing deadline.
async fn run_io(
    inner: Arc<Inner>,
    id: LinkId,
    stream: IoStream,
    mut cmds: mpsc::UnboundedReceiver<LinkCmd>,
) {
    let (mut rd, mut wr) = tokio::io::split(stream);

    let mut timeout = inner.lock().links.get(&id).and_then(|e| e.timeout);
    let mut sendq: VecDeque<(usize, Buffer)> = VecDeque::new();
    let mut rbuf: Option<Buffer> = None;
    let mut closing_deadline: Option<Instant> = None;
    let mut cmds_open = true;
    let mut last_activity = Instant::now();

    let outcome = loop {
        let closing = closing_deadline.is_some();
        let wake_at = match closing_deadline {
            Some(deadline) => deadline,
            None => last_activity + timeout.unwrap_or(FAR_FUTURE),
        };

        let recv_target = rbuf.get_or_insert_with(|| inner.alloc_recv_buffer());
        let writable = !closing && !sendq.is_empty();

        tokio::select! {
            biased;

            cmd = cmds.recv(), if cmds_open => match cmd {
                Some(LinkCmd::Send(outgoing)) => {
                    if closing {
                        inner.release_buffer(outgoing);
                    } else {
                        sendq.push_back((outgoing.len(), outgoing));
                    }
                }
                Some(LinkCmd::Retime(t)) => timeout = t,
                cmd => {
                    // explicit shutdown, or the registry entry is gone
                    if cmd.is_none() {
                        cmds_open = false;
                    }
                    if closing_deadline.is_none() {
                        let _ = wr.shutdown().await;
                        for (_, buffer) in sendq.drain(..) {
                            inner.release_buffer(buffer);
                        }
                        closing_deadline = Some(Instant::now() + inner.closing_timeout);
                    }
                }
            },

            result = write_front(&mut wr, &mut sendq), if writable => match result {
                Ok(sent) => {
                    let drained = sendq.is_empty();
                    inner.after_send(id, sent, drained);
                    last_activity = Instant::now();
                }
                Err(e) => {
                    debug!(%id, error = %e, "write failed");
                    break IoOutcome::Error;
                }
            },

            result = rd.read_buf(recv_target.data_mut()) => match result {
                Ok(0) => break IoOutcome::Eof,
                Ok(n) => {
                    trace!(%id, bytes = n, "received");
                    if let Some(buffer) = rbuf.take() {
                        inner.deliver_recv(id, buffer);
                    }
                    last_activity = Instant::now();
                }
                Err(e) => {
                    debug!(%id, error = %e, "read failed");
                    break IoOutcome::Error;
                }
            },

            () = tokio::time::sleep_until(wake_at) => {
                if closing {
                    break IoOutcome::ForcedClose;
                }
                inner.push_simple(id, LinkEvent::Timeout);
                last_activity = Instant::now();
            }
        }
    };

    if let Some(buffer) = rbuf.take() {
        inner.release_buffer(buffer);
    }
    for (_, buffer) in sendq.drain(..) {
        inner.release_buffer(buffer);
    }

    match outcome {
        IoOutcome::Eof => trace!(%id, "peer closed"),
        IoOutcome::Error => trace!(%id, "terminal error"),
        IoOutcome::ForcedClose => debug!(%id, "closing timeout elapsed, forcing teardown"),
    }
    inner.finish(id);
}

/// Writes the front of the queue until it is fully transmitted, popping it
/// and returning its original length. Partial progress survives
/// cancellation because the cursor lives in the buffer itself.
async fn write_front(
    wr: &mut WriteHalf<IoStream>,
    sendq: &mut VecDeque<(usize, Buffer)>,
) -> io::Result<usize> {
    let Some((len, buffer)) = sendq.front_mut() else {
        return Ok(0);
    };
    wr.write_all_buf(buffer.data_mut()).await?;
    wr.flush().await?;
    let sent = *len;
    sendq.pop_front();
    Ok(sent)
}
