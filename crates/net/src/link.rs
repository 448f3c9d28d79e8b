//! Per-socket registry state and lifecycle tags.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::buffer::Buffer;
use crate::event::{LinkEvent, LinkEvents};

/// Identifier for one managed socket, unique within its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub(crate) u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Caller-chosen value under which a link's events are delivered.
pub type Token = u64;

/// Which side of the TLS handshake a link still has to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeSide {
    Connect,
    Accept,
}

/// Lifecycle of one link.
///
/// `Connecting → Ready` for plain outbound links, with `Handshaking` in
/// between when TLS is involved (either side); accepted links start in
/// `Handshaking(Accept)` or directly in `Ready`. Any terminal condition or a
/// caller close moves the link to `Closing`, and a terminal socket event (or
/// the closing-timeout) to `Terminated`, after which the registry entry is
/// removed once the caller has also closed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Handshaking(HandshakeSide),
    Ready,
    Closing,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Outbound,
    Inbound,
    Listener,
}

/// Commands handed to the task that owns the socket.
pub(crate) enum LinkCmd {
    /// Append a caller-filled buffer to the outbound queue.
    Send(Buffer),
    /// Half-close the write side and begin the closing sequence.
    Shutdown,
    /// Replace the activity timeout.
    Retime(Option<Duration>),
}

/// Registry entry for one link, guarded by the transport lock.
pub(crate) struct LinkEntry {
    pub(crate) state: LinkState,
    pub(crate) role: Role,
    pub(crate) token: Token,
    pub(crate) handler: Arc<dyn LinkEvents>,
    pub(crate) timeout: Option<Duration>,
    /// Received buffers not yet delivered to the caller.
    pub(crate) inbound: VecDeque<Buffer>,
    /// Bytes queued behind the socket, not yet fully transmitted.
    pub(crate) queued_send_bytes: usize,
    /// Deliverable events in arrival order.
    pub(crate) pending: VecDeque<LinkEvent>,
    /// Membership flag for the transport's ready queue.
    pub(crate) in_ready_queue: bool,
    /// Whether the background worker already signalled `wake` for the
    /// current batch of pending events.
    pub(crate) wake_signalled: bool,
    /// Set by `close`; suppresses all further event delivery.
    pub(crate) caller_closed: bool,
    /// Bound local port, listeners only.
    pub(crate) local_port: Option<u16>,
    pub(crate) cmds: mpsc::UnboundedSender<LinkCmd>,
}

impl LinkEntry {
    pub(crate) fn new(
        role: Role,
        state: LinkState,
        token: Token,
        handler: Arc<dyn LinkEvents>,
        cmds: mpsc::UnboundedSender<LinkCmd>,
    ) -> Self {
        Self {
            state,
            role,
            token,
            handler,
            timeout: None,
            inbound: VecDeque::new(),
            queued_send_bytes: 0,
            pending: VecDeque::new(),
            in_ready_queue: false,
            wake_signalled: false,
            caller_closed: false,
            local_port: None,
            cmds,
        }
    }

    /// Whether events may still be queued for this link.
    pub(crate) fn accepts_events(&self) -> bool {
        !self.caller_closed
    }
}

impl fmt::Debug for LinkEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkEntry")
            .field("state", &self.state)
            .field("role", &self.role)
            .field("token", &self.token)
            .field("inbound", &self.inbound.len())
            .field("queued_send_bytes", &self.queued_send_bytes)
            .field("pending", &self.pending.len())
            .field("caller_closed", &self.caller_closed)
            .finish()
    }
}
