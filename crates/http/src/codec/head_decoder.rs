//! Response head decoder.
//!
//! Parses a status line and header block from raw bytes into a structured
//! [`ResponseHead`] and classifies the body framing that follows. Both
//! `\r\n\r\n` and bare `\n\n` terminators are accepted (httparse treats a
//! lone LF as a line end), header names are case-insensitive, and the head
//! is bounded by a fixed safety ceiling.
//!
//! The implementation parses with `httparse` into an uninitialized header
//! array, records the byte ranges of each name/value, then splits the head
//! off the source buffer and builds the header map zero-copy from those
//! ranges.

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version};
use httparse::Status;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, ResponseHead};

/// Maximum number of headers allowed in a response
const MAX_HEADER_NUM: usize = 64;

/// Maximum size in bytes allowed for the entire head section
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Decoder for HTTP response heads implementing the [`Decoder`] trait.
///
/// Yields the parsed head together with the [`PayloadSize`] classification
/// the payload decoder should be constructed from.
#[derive(Debug, Default)]
pub struct HeadDecoder;

impl Decoder for HeadDecoder {
    type Item = (ResponseHead, PayloadSize);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // shortest parseable head: "HTTP/1.1 200\n\n"
        if src.len() < 14 {
            ensure!(!looks_hopeless(src), ParseError::invalid_header("not a status line"));
            return Ok(None);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut resp = httparse::Response::new(&mut headers);

        let parsed = resp.parse(src).map_err(|e| match e {
            httparse::Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            e => ParseError::invalid_header(e.to_string()),
        });

        match parsed? {
            Status::Complete(head_end) => {
                trace!(head_size = head_end, "parsed response head");
                ensure!(
                    head_end <= MAX_HEADER_BYTES,
                    ParseError::too_large_header(head_end, MAX_HEADER_BYTES)
                );

                let header_count = resp.headers.len();
                ensure!(header_count <= MAX_HEADER_NUM, ParseError::too_many_headers(header_count));

                let mut header_index: [HeaderIndex; MAX_HEADER_NUM] = EMPTY_HEADER_INDEX_ARRAY;
                HeaderIndex::record(src, resp.headers, &mut header_index);

                let version = match resp.version {
                    Some(0) => Version::HTTP_10,
                    Some(1) => Version::HTTP_11,
                    v => return Err(ParseError::InvalidVersion(v)),
                };

                let status = resp
                    .code
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .ok_or(ParseError::InvalidStatus)?;

                let raw = src.split_to(head_end).freeze();

                let mut headers = HeaderMap::with_capacity(header_count);
                for index in &header_index[..header_count] {
                    // httparse verified the name is valid ASCII
                    let name = HeaderName::from_bytes(&raw[index.name.0..index.name.1])
                        .map_err(|e| ParseError::invalid_header(e.to_string()))?;

                    // httparse verified the value holds only visible ASCII,
                    // so the unchecked construction cannot produce an
                    // invalid value
                    let value = unsafe {
                        HeaderValue::from_maybe_shared_unchecked(
                            raw.slice(index.value.0..index.value.1),
                        )
                    };

                    headers.append(name, value);
                }

                let head = build_head(status, version, headers, raw)?;
                let payload_size = classify_payload(&head);
                Ok(Some((head, payload_size)))
            }
            Status::Partial => {
                ensure!(
                    src.len() <= MAX_HEADER_BYTES,
                    ParseError::too_large_header(src.len(), MAX_HEADER_BYTES)
                );
                Ok(None)
            }
        }
    }
}

/// An obviously-not-HTTP prefix fails fast instead of waiting for more
/// bytes that will never form a status line.
fn looks_hopeless(src: &BytesMut) -> bool {
    !b"HTTP/".starts_with(&src[..src.len().min(5)])
}

/// Byte ranges of one header's name and value inside the head block,
/// recorded so the header map can be built without copying.
#[derive(Clone, Copy)]
struct HeaderIndex {
    name: (usize, usize),
    value: (usize, usize),
}

const EMPTY_HEADER_INDEX: HeaderIndex = HeaderIndex { name: (0, 0), value: (0, 0) };

const EMPTY_HEADER_INDEX_ARRAY: [HeaderIndex; MAX_HEADER_NUM] =
    [EMPTY_HEADER_INDEX; MAX_HEADER_NUM];

impl HeaderIndex {
    fn record(bytes: &[u8], headers: &[httparse::Header<'_>], indices: &mut [HeaderIndex]) {
        let bytes_ptr = bytes.as_ptr() as usize;
        for (header, index) in headers.iter().zip(indices.iter_mut()) {
            let name_start = header.name.as_ptr() as usize - bytes_ptr;
            index.name = (name_start, name_start + header.name.len());
            let value_start = header.value.as_ptr() as usize - bytes_ptr;
            index.value = (value_start, value_start + header.value.len());
        }
    }
}

/// Extracts the connection metadata the engine negotiates from.
fn build_head(
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    raw: Bytes,
) -> Result<ResponseHead, ParseError> {
    let te_header = headers.get(http::header::TRANSFER_ENCODING);
    let cl_header = headers.get(http::header::CONTENT_LENGTH);

    let chunked = is_chunked(te_header);
    let content_length = match (te_header, cl_header) {
        (Some(_), Some(_)) => {
            // refer: https://www.rfc-editor.org/rfc/rfc9112.html#name-transfer-encoding
            return Err(ParseError::invalid_content_length(
                "transfer_encoding and content_length both present in headers",
            ));
        }
        (_, Some(value)) => {
            let text = value
                .to_str()
                .map_err(|_| ParseError::invalid_content_length("value can't to_str"))?;
            let length = text.trim().parse::<u64>().map_err(|_| {
                ParseError::invalid_content_length(format!("value {text} is not u64"))
            })?;
            Some(length)
        }
        _ => None,
    };

    let keep_alive = match connection_directive(&headers) {
        Some(ConnectionDirective::Close) => false,
        Some(ConnectionDirective::KeepAlive) => true,
        // absent: HTTP/1.1 defaults to persistent, HTTP/1.0 to close
        None => version == Version::HTTP_11,
    };

    let (keep_alive_max, keep_alive_timeout) = headers
        .get("keep-alive")
        .map(parse_keep_alive)
        .unwrap_or((None, None));

    let has_trailer = headers.contains_key(http::header::TRAILER);
    let location = headers
        .get(http::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    Ok(ResponseHead {
        status,
        version,
        headers,
        raw,
        keep_alive,
        keep_alive_max,
        keep_alive_timeout,
        chunked,
        content_length,
        has_trailer,
        location,
    })
}

/// Body framing per RFC 9112 §6, with the legacy fallback: no length, no
/// chunking and no keep-alive means the body runs until the socket closes.
fn classify_payload(head: &ResponseHead) -> PayloadSize {
    if head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return PayloadSize::Empty;
    }
    if head.chunked {
        return PayloadSize::Chunked;
    }
    match head.content_length {
        Some(0) => PayloadSize::Empty,
        Some(length) => PayloadSize::Length(length),
        None if !head.keep_alive => PayloadSize::UntilClose,
        None => PayloadSize::Empty,
    }
}

enum ConnectionDirective {
    Close,
    KeepAlive,
}

/// Scans the `Connection` header's comma-separated directives.
fn connection_directive(headers: &HeaderMap) -> Option<ConnectionDirective> {
    let value = headers.get(http::header::CONNECTION)?;
    let text = value.to_str().ok()?;
    for directive in text.split(',') {
        let directive = directive.trim();
        if directive.eq_ignore_ascii_case("close") {
            return Some(ConnectionDirective::Close);
        }
        if directive.eq_ignore_ascii_case("keep-alive") {
            return Some(ConnectionDirective::KeepAlive);
        }
    }
    None
}

/// Parses `Keep-Alive: timeout=N, max=M` into `(max, timeout)`. Unknown or
/// malformed parameters are ignored.
fn parse_keep_alive(value: &HeaderValue) -> (Option<u32>, Option<u32>) {
    let Ok(text) = value.to_str() else {
        return (None, None);
    };
    let mut max = None;
    let mut timeout = None;
    for parameter in text.split(',') {
        let mut parts = parameter.splitn(2, '=');
        let key = parts.next().unwrap_or("").trim();
        let val = parts.next().unwrap_or("").trim();
        if key.eq_ignore_ascii_case("max") {
            max = val.parse().ok();
        } else if key.eq_ignore_ascii_case("timeout") {
            timeout = val.parse().ok();
        }
    }
    (max, timeout)
}

/// Checks if the Transfer-Encoding header ends in chunked; chunked must be
/// the last encoding if present.
fn is_chunked(header_value: Option<&HeaderValue>) -> bool {
    const CHUNKED: &[u8] = b"chunked";
    if let Some(value) = header_value {
        if let Some(bytes) = value.as_bytes().rsplit(|b| *b == b',').next() {
            return bytes.trim_ascii() == CHUNKED;
        }
    }
    false
}
