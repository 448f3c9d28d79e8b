//! The connection engine: query queues, keep-alive and pipelining
//! negotiation, reconnect-and-retry policy.
//!
//! An [`HttpConnection`] wraps at most one transport link at a time.
//! Queries accumulate in a wait queue; [`HttpConnection::process`] is the
//! single driving call that (re)connects, writes as many queued queries as
//! the negotiated window allows, parses buffered inbound bytes, and fires
//! completion callbacks — always outside the engine's lock, so a callback
//! may submit follow-up queries or close the connection.
//!
//! Failure model: every query completes exactly once through its own
//! callback. Retry-eligible queries are silently resent after a link loss,
//! up to [`HTTP_FAILED_RETRY_MAXIMUM`] consecutive failures; everything
//! else fails fast with a result code. A malformed response cannot be
//! resynchronized, so it fails every outstanding query and drops the link.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use tether_net::buffer::Buffer;
use tether_net::event::LinkEvents;
use tether_net::link::{LinkId, Token};
use tether_net::transport::Transport;

use crate::protocol::{Response, ResponseHead};
use crate::query::{Query, QueryCallback, QueryFlags, QueryProgress, QueryStatus};

/// Consecutive connect/query failures tolerated before the whole pending
/// and in-flight set is failed with [`QueryStatus::ConnectError`].
pub const HTTP_FAILED_RETRY_MAXIMUM: u32 = 3;

/// Hard ceiling on pipelined in-flight requests, regardless of what the
/// server declares.
pub const PIPELINE_HARD_LIMIT: u32 = 16;

/// Construction-time settings for one HTTP connection.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    /// Wrap the link in TLS.
    pub tls: bool,
    /// Reuse the socket across requests when the server permits it.
    pub keep_alive: bool,
    /// Allow writing requests before earlier responses arrive, once the
    /// server has demonstrated keep-alive support. Individual queries must
    /// also opt in via [`QueryFlags::pipeline`].
    pub pipeline: bool,
    /// Link timeout while no response is outstanding.
    pub idle_timeout: Duration,
    /// Link timeout while a response is outstanding; on expiry the link is
    /// dropped and the retry policy applies.
    pub waiting_timeout: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            tls: false,
            keep_alive: true,
            pipeline: false,
            idle_timeout: Duration::from_secs(30),
            waiting_timeout: Duration::from_secs(10),
        }
    }
}

/// Coarse engine phase, for supervising layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatus {
    /// No link and nothing queued.
    Idle,
    /// A link is being established.
    Connecting,
    /// Link up, no response outstanding.
    Ready,
    /// Link up, awaiting at least one response.
    Waiting,
    /// Closed by the caller; queries are rejected.
    Closed,
}

type Completion = (QueryCallback, QueryStatus, Option<Response>);

/// A request/response engine over one (repeatedly re-established)
/// transport link. Cheap to clone; clones share the same queues.
#[derive(Clone)]
pub struct HttpConnection {
    transport: Transport,
    engine: Arc<Mutex<Engine>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Absent,
    Connecting,
    Ready,
}

struct Engine {
    host: String,
    port: u16,
    options: HttpOptions,
    link: Option<LinkId>,
    phase: Phase,
    closed: bool,
    /// Discriminates events of the current link from a predecessor's.
    generation: u64,
    /// Inbound bytes not yet consumed by the front query's parser.
    recv: BytesMut,
    wait_queue: VecDeque<Query>,
    sent_queue: VecDeque<Query>,
    sent_since_connect: u32,
    /// How many more requests the server accepts on this socket.
    budget: u32,
    keep_alive_observed: Option<bool>,
    consecutive_failures: u32,
    error_count: u32,
    link_lost: bool,
    timed_out: bool,
    link_timeout: Option<Duration>,
    wake_callback: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl HttpConnection {
    /// Pure construction; no socket exists until the first
    /// [`process`](Self::process) finds queued work.
    pub fn open(transport: &Transport, host: impl Into<String>, port: u16, options: HttpOptions) -> Self {
        let engine = Engine {
            host: host.into(),
            port,
            options,
            link: None,
            phase: Phase::Absent,
            closed: false,
            generation: 0,
            recv: BytesMut::new(),
            wait_queue: VecDeque::new(),
            sent_queue: VecDeque::new(),
            sent_since_connect: 0,
            budget: 1,
            keep_alive_observed: None,
            consecutive_failures: 0,
            error_count: 0,
            link_lost: false,
            timed_out: false,
            link_timeout: None,
            wake_callback: None,
        };
        Self { transport: transport.clone(), engine: Arc::new(Mutex::new(engine)) }
    }

    /// Appends a query to the wait queue and returns immediately. The
    /// request bytes are transmitted verbatim and retained until completion
    /// for a possible resend.
    pub fn add_query<F>(&self, request: impl Into<Bytes>, flags: QueryFlags, callback: F)
    where
        F: FnOnce(QueryStatus, Option<Response>) + Send + 'static,
    {
        let callback: QueryCallback = Box::new(callback);
        let rejected = {
            let mut engine = self.lock();
            if engine.closed {
                Some(callback)
            } else {
                engine.wait_queue.push_back(Query::new(request.into(), flags, callback));
                None
            }
        };
        if let Some(callback) = rejected {
            callback(QueryStatus::ConnectError, None);
        }
    }

    /// The single driving call: handles link loss and timeouts, reconnects
    /// when needed, writes queued queries within the negotiated window,
    /// parses buffered responses and fires completion callbacks.
    pub fn process(&self) {
        let mut completions: Vec<Completion> = Vec::new();
        {
            let mut engine = self.lock();
            if !engine.closed {
                engine.pump_parse(&self.transport, &mut completions);
                engine.handle_link_loss(&self.transport, &mut completions);
                engine.recycle_if_exhausted(&self.transport);
                engine.ensure_link(&self.transport, &self.engine, &mut completions);
                engine.pump_send(&self.transport);
                engine.update_link_timeout(&self.transport);
            }
        }
        fire(completions);
    }

    /// Fails every pending and in-flight query with
    /// [`QueryStatus::ConnectError`] and tears the link down. Further
    /// queries are rejected.
    pub fn close(&self) {
        let mut completions: Vec<Completion> = Vec::new();
        {
            let mut engine = self.lock();
            if engine.closed {
                return;
            }
            engine.closed = true;
            if let Some(link) = engine.link.take() {
                self.transport.close(link);
            }
            engine.fail_all(&mut completions, QueryStatus::ConnectError);
            engine.phase = Phase::Absent;
        }
        fire(completions);
    }

    /// Replaces the waiting timeout (the deadline for an outstanding
    /// response). Applied to the live link immediately.
    pub fn set_timeout(&self, waiting: Duration) {
        let mut engine = self.lock();
        engine.options.waiting_timeout = waiting;
        engine.link_timeout = None;
        engine.update_link_timeout(&self.transport);
    }

    /// Marks every pending and in-flight query so that a link loss fails it
    /// fast as [`QueryStatus::NoReply`] instead of retrying. Queries whose
    /// responses arrive normally still complete.
    pub fn abort_queue(&self) {
        let mut engine = self.lock();
        for query in engine.wait_queue.iter_mut() {
            query.abort();
        }
        for query in engine.sent_queue.iter_mut() {
            query.abort();
        }
    }

    /// Queries not yet completed: waiting plus in-flight.
    pub fn query_count(&self) -> usize {
        let engine = self.lock();
        engine.wait_queue.len() + engine.sent_queue.len()
    }

    /// Reads and clears the accumulated failure counter, so a supervising
    /// layer can judge a connection strategy across many queries.
    pub fn take_error_count(&self) -> u32 {
        std::mem::take(&mut self.lock().error_count)
    }

    pub fn status(&self) -> HttpStatus {
        let engine = self.lock();
        if engine.closed {
            return HttpStatus::Closed;
        }
        match engine.phase {
            Phase::Absent => HttpStatus::Idle,
            Phase::Connecting => HttpStatus::Connecting,
            Phase::Ready => {
                if engine.sent_queue.is_empty() {
                    HttpStatus::Ready
                } else {
                    HttpStatus::Waiting
                }
            }
        }
    }

    /// Installs a callback invoked whenever transport activity relevant to
    /// this connection is observed, so a caller driven by an external loop
    /// knows to call [`process`](Self::process).
    pub fn set_wake_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.lock().wake_callback = Some(Arc::new(callback));
    }

    fn lock(&self) -> MutexGuard<'_, Engine> {
        match self.engine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let engine = self.lock();
        f.debug_struct("HttpConnection")
            .field("host", &engine.host)
            .field("port", &engine.port)
            .field("phase", &engine.phase)
            .field("waiting", &engine.wait_queue.len())
            .field("in_flight", &engine.sent_queue.len())
            .finish()
    }
}

fn fire(completions: Vec<Completion>) {
    for (callback, status, response) in completions {
        callback(status, response);
    }
}

impl Engine {
    /// Parses buffered inbound bytes into the front in-flight query;
    /// pipelined responses are consumed strictly in send order.
    fn pump_parse(&mut self, transport: &Transport, completions: &mut Vec<Completion>) {
        while !self.recv.is_empty() {
            let Some(front) = self.sent_queue.front_mut() else {
                break;
            };
            match front.feed(&mut self.recv) {
                Ok(QueryProgress::Complete) => {
                    let Some(query) = self.sent_queue.pop_front() else {
                        break;
                    };
                    if let Some(head) = query.head() {
                        self.note_response(head, query.pipeline_index);
                    }
                    self.consecutive_failures = 0;
                    trace!(index = query.pipeline_index, "query completed");
                    completions.push(query.into_outcome(QueryStatus::Success));
                }
                Ok(QueryProgress::Incomplete) => break,
                Err(e) => {
                    // mid-stream framing is unrecoverable, the whole
                    // connection goes down with it
                    warn!(error = %e, "malformed response, failing connection");
                    if let Some(link) = self.link.take() {
                        transport.close(link);
                    }
                    self.fail_all(completions, QueryStatus::BadFormat);
                    self.reset_link();
                    break;
                }
            }
        }
    }

    /// Applies the retry policy after a timeout or a reported link loss.
    fn handle_link_loss(&mut self, transport: &Transport, completions: &mut Vec<Completion>) {
        if self.timed_out {
            self.timed_out = false;
            if let Some(link) = self.link.take() {
                if self.sent_queue.is_empty() {
                    // idle expiry, recycle the socket quietly
                    debug!(%link, "idle timeout, dropping link");
                    transport.close(link);
                    self.reset_link();
                } else {
                    debug!(%link, "response timeout, dropping link");
                    transport.close(link);
                    self.link_lost = false;
                    self.reset_link();
                    self.on_lost(false, completions);
                }
            }
        }

        if self.link_lost {
            self.link_lost = false;
            let was_connecting = self.phase == Phase::Connecting;
            if let Some(link) = self.link.take() {
                transport.close(link);
            }
            self.reset_link();
            self.on_lost(was_connecting, completions);
        }
    }

    /// The link is gone. Complete an until-close response, count the
    /// failure, then either fail everything (ceiling reached) or re-queue
    /// the retry-eligible prefix and fail the rest.
    fn on_lost(&mut self, was_connecting: bool, completions: &mut Vec<Completion>) {
        if let Some(front) = self.sent_queue.front() {
            if front.completes_on_close() {
                if let Some(query) = self.sent_queue.pop_front() {
                    trace!("link close terminated an until-close body");
                    self.consecutive_failures = 0;
                    completions.push(query.into_outcome(QueryStatus::Success));
                }
            }
        }

        let failure = was_connecting || !self.sent_queue.is_empty();
        if failure {
            self.consecutive_failures += 1;
            debug!(failures = self.consecutive_failures, "link lost with work outstanding");
            if self.consecutive_failures >= HTTP_FAILED_RETRY_MAXIMUM {
                self.consecutive_failures = 0;
                self.fail_all(completions, QueryStatus::ConnectError);
                return;
            }
        }

        // retry-eligible prefix goes back to the front of the wait queue in
        // original order; from the first ineligible query on, everything
        // fails rather than being resent silently
        let mut requeue: Vec<Query> = Vec::new();
        let mut failing = false;
        while let Some(mut query) = self.sent_queue.pop_front() {
            if !failing && query.retry_eligible() {
                query.reset_for_resend();
                requeue.push(query);
            } else {
                failing = true;
                let status =
                    if query.retry_eligible() { QueryStatus::TryAgain } else { QueryStatus::NoReply };
                self.error_count += 1;
                completions.push(query.into_outcome(status));
            }
        }
        for query in requeue.into_iter().rev() {
            self.wait_queue.push_front(query);
        }
    }

    /// A served-out keep-alive socket (budget exhausted or keep-alive
    /// refused) is dropped once its responses are drained.
    fn recycle_if_exhausted(&mut self, transport: &Transport) {
        if self.phase == Phase::Ready && self.budget == 0 && self.sent_queue.is_empty() {
            if let Some(link) = self.link.take() {
                debug!(%link, "keep-alive budget exhausted, recycling link");
                transport.close(link);
            }
            self.reset_link();
        }
    }

    /// Starts a connect when there is work and no link. A synchronous
    /// failure (resolution) counts against the retry ceiling immediately.
    fn ensure_link(
        &mut self,
        transport: &Transport,
        engine: &Arc<Mutex<Engine>>,
        completions: &mut Vec<Completion>,
    ) {
        if self.link.is_some() || self.wait_queue.is_empty() {
            return;
        }

        self.generation += 1;
        let bridge = Arc::new(LinkBridge {
            transport: transport.clone(),
            engine: Arc::downgrade(engine),
        });
        match transport.connect(&self.host, self.port, self.options.tls, self.generation, bridge) {
            Ok(link) => {
                debug!(%link, host = %self.host, port = self.port, "link requested");
                self.link = Some(link);
                self.phase = Phase::Connecting;
                self.sent_since_connect = 0;
                self.budget = 1;
            }
            Err(e) => {
                debug!(error = %e, "connect failed fast");
                self.consecutive_failures += 1;
                if self.consecutive_failures >= HTTP_FAILED_RETRY_MAXIMUM {
                    self.consecutive_failures = 0;
                    self.fail_all(completions, QueryStatus::ConnectError);
                }
            }
        }
    }

    /// Writes queued queries within the negotiated window: one at a time
    /// until the server demonstrates keep-alive, then up to the declared
    /// budget, hard-clamped, for mutually pipelining-willing parties.
    fn pump_send(&mut self, transport: &Transport) {
        if self.phase != Phase::Ready {
            return;
        }
        let Some(link) = self.link else {
            return;
        };

        loop {
            if self.budget == 0 {
                break;
            }
            let window = if self.pipelining_active() { PIPELINE_HARD_LIMIT } else { 1 };
            if self.sent_queue.len() as u32 >= window {
                break;
            }
            let Some(front) = self.wait_queue.front() else {
                break;
            };
            if !self.sent_queue.is_empty()
                && !(self.pipelining_active() && front.pipeline_allowed())
            {
                break;
            }

            let Some(mut query) = self.wait_queue.pop_front() else {
                break;
            };
            let request = query.request();
            let mut buffer = transport.allocate_send_buffer(request.len());
            buffer.put_slice(&request);
            if transport.queue_send_buffer(link, buffer).is_err() {
                // link raced into closing; loss handling picks it up next
                self.wait_queue.push_front(query);
                break;
            }

            trace!(bytes = request.len(), index = self.sent_since_connect, "query written");
            query.pipeline_index = self.sent_since_connect;
            self.sent_since_connect += 1;
            self.budget -= 1;
            self.sent_queue.push_back(query);
        }
    }

    /// Records the server's keep-alive verdict carried by a completed
    /// response. The remaining budget is the declared `max=` offset by the
    /// requests already pipelined past the responding query, hard-clamped.
    fn note_response(&mut self, head: &ResponseHead, pipeline_index: u32) {
        let allowed = head.keep_alive() && self.options.keep_alive;
        self.keep_alive_observed = Some(allowed);
        if !allowed {
            self.budget = 0;
            return;
        }
        self.budget = match head.keep_alive_max() {
            Some(max) => {
                let consumed_past = self.sent_since_connect.saturating_sub(pipeline_index + 1);
                max.saturating_sub(consumed_past).min(PIPELINE_HARD_LIMIT)
            }
            None => PIPELINE_HARD_LIMIT,
        };
    }

    fn pipelining_active(&self) -> bool {
        self.options.pipeline && self.keep_alive_observed == Some(true)
    }

    /// Fails every pending and in-flight query with `status`.
    fn fail_all(&mut self, completions: &mut Vec<Completion>, status: QueryStatus) {
        for query in self.sent_queue.drain(..) {
            self.error_count += 1;
            completions.push(query.into_outcome(status));
        }
        for query in self.wait_queue.drain(..) {
            self.error_count += 1;
            completions.push(query.into_outcome(status));
        }
        self.recv.clear();
    }

    fn reset_link(&mut self) {
        self.link = None;
        self.phase = Phase::Absent;
        self.sent_since_connect = 0;
        self.budget = 1;
        self.keep_alive_observed = None;
        self.recv.clear();
        self.link_timeout = None;
    }

    /// Keeps the transport timeout in step with the engine state: waiting
    /// deadline with responses outstanding, idle deadline otherwise.
    fn update_link_timeout(&mut self, transport: &Transport) {
        let Some(link) = self.link else {
            return;
        };
        let desired = if self.sent_queue.is_empty() {
            self.options.idle_timeout
        } else {
            self.options.waiting_timeout
        };
        if self.link_timeout != Some(desired)
            && transport.set_timeout(link, Some(desired)).is_ok()
        {
            self.link_timeout = Some(desired);
        }
    }
}

/// Adapter translating transport events into engine flags. Does the bare
/// minimum under the engine lock and defers real work to `process`,
/// nudging the wake callback so an externally-driven caller knows to call
/// it.
struct LinkBridge {
    transport: Transport,
    engine: Weak<Mutex<Engine>>,
}

impl LinkBridge {
    /// Applies `apply` to the engine if it still exists and the event
    /// belongs to the current link generation, then fires the wake
    /// callback outside the lock.
    fn with_engine(&self, generation: Token, apply: impl FnOnce(&mut Engine)) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let wake = {
            let mut guard = match engine.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if guard.generation != generation {
                return;
            }
            apply(&mut guard);
            guard.wake_callback.clone()
        };
        if let Some(wake) = wake {
            wake();
        }
    }
}

impl LinkEvents for LinkBridge {
    fn incoming(&self, _listener: Token, _link: LinkId) -> Token {
        // a client engine never listens
        0
    }

    fn recv(&self, token: Token, buffer: Buffer) {
        self.with_engine(token, |engine| engine.recv.extend_from_slice(buffer.bytes()));
        self.transport.release_recv_buffer(buffer);
    }

    fn send_ready(&self, token: Token, _queued: usize) {
        self.with_engine(token, |engine| {
            if engine.phase == Phase::Connecting {
                engine.phase = Phase::Ready;
            }
        });
    }

    fn send_finished(&self, token: Token) {
        self.with_engine(token, |_| {});
    }

    fn timeout(&self, token: Token) {
        self.with_engine(token, |engine| engine.timed_out = true);
    }

    fn closed(&self, token: Token) {
        self.with_engine(token, |engine| engine.link_lost = true);
    }

    fn wake(&self, token: Token) {
        self.with_engine(token, |_| {});
    }
}
