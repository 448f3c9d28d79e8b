//! Event vocabulary and the per-role callback seam.
//!
//! Every deliverable state transition is queued as a [`LinkEvent`] on its
//! link and dispatched, in queue order, to the [`LinkEvents`] implementation
//! the link was registered with. Dispatch always happens with the transport
//! lock released, so an implementation may freely call back into the
//! transport (queue a send, allocate a buffer, close the link) — with the
//! single exception that it must not re-enter the blocking wait call.

use crate::buffer::Buffer;
use crate::link::{LinkId, Token};

/// A deliverable state transition, queued per link until dispatched.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    /// A listening link accepted a child link.
    Incoming(LinkId),
    /// The inbound queue holds a buffer to deliver.
    Recv,
    /// The link can accept more outbound data; payload is the number of
    /// bytes still queued behind it.
    SendReady(usize),
    /// Outbound backlog crossed the backpressure threshold.
    SendWait(usize),
    /// The outbound queue fully drained.
    SendFinished,
    /// The per-link activity timeout elapsed.
    Timeout,
    /// The socket reached a terminal state without a caller close.
    Closed,
}

/// Callbacks bound to a link role at `connect`/`listen` time.
///
/// The `token` is the caller-chosen value registered for the link; for
/// accepted links it is whatever [`incoming`](Self::incoming) returned.
/// Default implementations are provided for the optional hints.
pub trait LinkEvents: Send + Sync + 'static {
    /// A listening link accepted `link`. Returns the token under which all
    /// further events for `link` are delivered.
    fn incoming(&self, listener: Token, link: LinkId) -> Token;

    /// A receive buffer is delivered. Ownership moves to the callee, which
    /// must hand the buffer back through `release_recv_buffer` once done.
    fn recv(&self, token: Token, buffer: Buffer);

    /// The link is established or has drained enough to accept more
    /// outbound data; `queued` is the byte count still waiting to be sent.
    fn send_ready(&self, token: Token, queued: usize);

    /// Backpressure hint: the outbound backlog is `queued` bytes deep.
    fn send_wait(&self, _token: Token, _queued: usize) {}

    /// Every queued outbound buffer has been fully transmitted.
    fn send_finished(&self, token: Token);

    /// The activity timeout elapsed. Not fatal by itself; the link stays
    /// usable and the timer re-arms.
    fn timeout(&self, token: Token);

    /// The socket reached a terminal state (error, EOF, forced close).
    /// Never delivered after the caller itself closed the link.
    fn closed(&self, token: Token);

    /// Fired by the background worker when events are ready for this link,
    /// so an externally-driven caller knows to call `flush`/`process`.
    fn wake(&self, _token: Token) {}
}
