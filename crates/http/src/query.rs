//! One request/response exchange and its completion contract.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::codec::ResponseDecoder;
use crate::protocol::{Message, ParseError, PayloadItem, Response, ResponseHead};

/// Result code delivered to a query's completion callback.
///
/// Every query completes exactly once, through its callback, with one of
/// these. The last four are reserved for the calling layer's own
/// interpretation of an otherwise-successful exchange (a bad status code,
/// an invalid body); the engine itself never produces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// A complete response was received.
    Success,
    /// The socket could not be established or re-established within the
    /// retry ceiling.
    ConnectError,
    /// The link dropped after the query may have reached the server; safe
    /// to resubmit at the caller's discretion.
    TryAgain,
    /// The link dropped and the query was not retry-eligible, or was
    /// explicitly aborted.
    NoReply,
    /// Malformed response head or chunk framing.
    BadFormat,
    /// Reserved for the caller: unacceptable status code.
    CodeError,
    /// Reserved for the caller: response body failed to parse.
    ParseError,
    /// Reserved for the caller: response could not be processed.
    ProcessError,
    /// Reserved for the caller: internal failure.
    SystemError,
}

impl QueryStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, QueryStatus::Success)
    }
}

/// Per-query submission flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryFlags {
    /// The request may be silently resent after a link loss. Only set this
    /// for requests that are safe to execute twice.
    pub retry: bool,
    /// The request may be written before earlier responses have arrived,
    /// once the server has demonstrated keep-alive support.
    pub pipeline: bool,
}

impl QueryFlags {
    pub fn retry() -> Self {
        Self { retry: true, pipeline: false }
    }

    pub fn pipelined() -> Self {
        Self { retry: false, pipeline: true }
    }
}

/// Completion callback: result code plus, on success, the parsed response.
pub type QueryCallback = Box<dyn FnOnce(QueryStatus, Option<Response>) + Send + 'static>;

pub(crate) enum QueryProgress {
    /// More inbound bytes are needed.
    Incomplete,
    /// The response is fully parsed.
    Complete,
}

/// One in-flight exchange: the retained request bytes (kept for a possible
/// resend), the incremental parse state, and the completion callback.
pub(crate) struct Query {
    request: Bytes,
    flags: QueryFlags,
    aborted: bool,
    /// Position among the requests sent since the last reconnect.
    pub(crate) pipeline_index: u32,
    decoder: ResponseDecoder,
    head: Option<ResponseHead>,
    body: BytesMut,
    callback: QueryCallback,
}

impl Query {
    pub(crate) fn new(request: Bytes, flags: QueryFlags, callback: QueryCallback) -> Self {
        Self {
            request,
            flags,
            aborted: false,
            pipeline_index: 0,
            decoder: ResponseDecoder::new(),
            head: None,
            body: BytesMut::new(),
            callback,
        }
    }

    pub(crate) fn request(&self) -> Bytes {
        self.request.clone()
    }

    /// Whether a silent resend is permitted after a link loss.
    pub(crate) fn retry_eligible(&self) -> bool {
        self.flags.retry && !self.aborted
    }

    pub(crate) fn pipeline_allowed(&self) -> bool {
        self.flags.pipeline
    }

    /// Marks the query so a link loss fails it fast instead of retrying.
    pub(crate) fn abort(&mut self) {
        self.aborted = true;
    }

    pub(crate) fn head(&self) -> Option<&ResponseHead> {
        self.head.as_ref()
    }

    /// Feeds buffered inbound bytes through the response decoder,
    /// accumulating body data until the response completes.
    pub(crate) fn feed(&mut self, src: &mut BytesMut) -> Result<QueryProgress, ParseError> {
        loop {
            match self.decoder.decode(src)? {
                Some(Message::Head((head, _))) => {
                    self.head = Some(head);
                }
                Some(Message::Payload(PayloadItem::Chunk(bytes))) => {
                    self.body.extend_from_slice(&bytes);
                }
                Some(Message::Payload(PayloadItem::Eof)) => {
                    if self.decoder.saw_trailer() {
                        if let Some(head) = &mut self.head {
                            head.has_trailer = true;
                        }
                    }
                    return Ok(QueryProgress::Complete);
                }
                None => return Ok(QueryProgress::Incomplete),
            }
        }
    }

    /// Whether a link close terminates this query successfully: only in the
    /// read-until-close body class, once the head has been parsed. The body
    /// is then whatever bytes arrived.
    pub(crate) fn completes_on_close(&self) -> bool {
        self.head.is_some() && self.decoder.is_until_close()
    }

    /// Rewinds all parse state so the retained request can be resent on a
    /// fresh link.
    pub(crate) fn reset_for_resend(&mut self) {
        self.decoder = ResponseDecoder::new();
        self.head = None;
        self.body.clear();
        self.pipeline_index = 0;
    }

    /// Consumes the query into its callback invocation parts. A response is
    /// attached only for a success with a parsed head.
    pub(crate) fn into_outcome(
        self,
        status: QueryStatus,
    ) -> (QueryCallback, QueryStatus, Option<Response>) {
        let Query { head, body, callback, .. } = self;
        let response = match (status, head) {
            (QueryStatus::Success, Some(head)) => Some(Response::new(head, body.freeze())),
            _ => None,
        };
        (callback, status, response)
    }
}
