//! Parsed response types on the client side of an exchange.

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};

/// The parsed head of one HTTP response, plus the connection metadata the
/// engine negotiates from: keep-alive permission and limits, body framing,
/// trailer announcement and redirect target.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    /// The raw header block exactly as it arrived on the wire.
    pub(crate) raw: Bytes,
    pub(crate) keep_alive: bool,
    pub(crate) keep_alive_max: Option<u32>,
    pub(crate) keep_alive_timeout: Option<u32>,
    pub(crate) chunked: bool,
    pub(crate) content_length: Option<u64>,
    pub(crate) has_trailer: bool,
    pub(crate) location: Option<String>,
}

impl ResponseHead {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The unparsed header block, status line included.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Whether the server permits reusing this socket for another request.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// The server-declared cap on further requests for this socket, from
    /// `Keep-Alive: max=`.
    pub fn keep_alive_max(&self) -> Option<u32> {
        self.keep_alive_max
    }

    /// Idle seconds the server intends to keep the socket open, from
    /// `Keep-Alive: timeout=`.
    pub fn keep_alive_timeout(&self) -> Option<u32> {
        self.keep_alive_timeout
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Whether trailers were announced (`Trailer` header) or actually seen
    /// after the terminal chunk.
    pub fn has_trailer(&self) -> bool {
        self.has_trailer
    }

    /// The `Location` header value, when present.
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }
}

/// One complete response: head plus the reassembled body.
#[derive(Debug, Clone)]
pub struct Response {
    head: ResponseHead,
    body: Bytes,
}

impl Response {
    pub(crate) fn new(head: ResponseHead, body: Bytes) -> Self {
        Self { head, body }
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_parts(self) -> (ResponseHead, Bytes) {
        (self.head, self.body)
    }
}
